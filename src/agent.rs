//! Agent identity and the agent CLI invocation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{Config, RoleProfile};

/// Identifier of one worker execution. A fresh id is minted per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent-{}", self.short())
    }
}

/// The agent CLI as configured, e.g. `codex exec`.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    base_command: Vec<String>,
}

impl AgentCommand {
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.agent.command)
    }

    pub fn new(command: &str) -> Self {
        Self {
            base_command: command.split_whitespace().map(String::from).collect(),
        }
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("codex")
    }

    /// Full argv for one task: base command, role permissions, prompt.
    pub fn command(&self, profile: &RoleProfile, prompt: &str) -> Vec<String> {
        let mut cmd = self.base_command.clone();
        if cmd.is_empty() {
            cmd.push(self.binary().to_string());
        }
        cmd.extend([
            "--ask-for-approval".to_string(),
            profile.approval.clone(),
            "--sandbox".to_string(),
            profile.sandbox.clone(),
            prompt.to_string(),
        ]);
        cmd
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Prompt handed to the agent for a task.
pub fn task_prompt(role: &str, title: &str, description: &str) -> String {
    if description.trim().is_empty() {
        format!("[{}] {}", role, title)
    } else {
        format!("[{}] {}\n\n{}", role, title, description)
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::task::{BackoffKind, RetryPolicy, DEFAULT_TASK_TIMEOUT_MS};
use crate::orchestration::events::StdoutMode;
use crate::orchestration::pool::CancelPolicy;
use crate::orchestration::redact::{Redactor, DEFAULT_PATTERNS};
use crate::orchestration::resources::ResourceThresholds;
use crate::orchestration::roles::{default_rules, RoleRule};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    /// Keyword rules for role assignment. Empty means the built-in set.
    #[serde(default)]
    pub roles: Vec<RoleRule>,
    /// Per-role agent permissions, keyed by role name.
    #[serde(default)]
    pub profiles: BTreeMap<String, RoleProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrency: usize,
    pub success_threshold: f64,
    pub task_timeout_ms: u64,
    pub sessions_dir: String,
    pub stdout_events: StdoutMode,
    pub cancel_policy: CancelPolicy,
    /// Test command quoted in remediation hints; detected when unset.
    pub test_command: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            success_threshold: 0.9,
            task_timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            sessions_dir: ".maestro/sessions".to_string(),
            stdout_events: StdoutMode::Essential,
            cancel_policy: CancelPolicy::Drain,
            test_command: None,
        }
    }
}

/// Run-wide retry defaults; task files may override per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            backoff: policy.backoff,
            initial_delay_ms: policy.initial_delay_ms,
            max_delay_ms: policy.max_delay_ms,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub cpu_threshold: f64,
    /// Absolute threshold; 90% of total memory when unset.
    pub memory_threshold_bytes: Option<u64>,
    pub hysteresis: f64,
    pub poll_interval_ms: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: 0.85,
            memory_threshold_bytes: None,
            hysteresis: 0.1,
            poll_interval_ms: 1_000,
        }
    }
}

impl ResourceConfig {
    pub fn thresholds(&self, total_memory: u64) -> ResourceThresholds {
        ResourceThresholds {
            cpu_threshold: self.cpu_threshold,
            memory_threshold: self
                .memory_threshold_bytes
                .unwrap_or(total_memory / 10 * 9),
            hysteresis: self.hysteresis,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI invoked for tasks without their own command.
    pub command: String,
    /// Command that turns a requirement into a JSON task list.
    pub decompose_command: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "codex exec".to_string(),
            decompose_command: None,
        }
    }
}

/// Patterns masked out of event payloads. An empty list turns masking off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    pub patterns: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl RedactionConfig {
    pub fn redactor(&self) -> Result<Redactor> {
        Redactor::new(&self.patterns)
    }
}

/// Permissions the agent runs with for a given role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleProfile {
    pub approval: String,
    pub sandbox: String,
}

impl Default for RoleProfile {
    fn default() -> Self {
        Self {
            approval: "never".to_string(),
            sandbox: "workspace-write".to_string(),
        }
    }
}

impl Config {
    pub fn maestro_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".maestro"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("maestro.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading config");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            max_concurrency = config.orchestrator.max_concurrency,
            success_threshold = config.orchestrator.success_threshold,
            rules = config.roles.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_concurrency == 0 {
            return Err(Error::InvalidInput(
                "orchestrator.max_concurrency must be at least 1".to_string(),
            ));
        }
        validate_threshold(self.orchestrator.success_threshold)?;
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        self.redaction.redactor()?;
        Ok(())
    }

    /// Role rules in effect.
    pub fn role_rules(&self) -> Vec<RoleRule> {
        if self.roles.is_empty() {
            default_rules()
        } else {
            self.roles.clone()
        }
    }

    /// Test command to quote in remediation hints for `workdir`.
    pub fn test_command(&self, workdir: &Path) -> String {
        if let Some(cmd) = &self.orchestrator.test_command {
            return cmd.clone();
        }
        detect_test_command(workdir).to_string()
    }
}

pub fn validate_threshold(threshold: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(Error::InvalidInput(format!(
            "success threshold must be within 0..1, got {}",
            threshold
        )));
    }
    Ok(())
}

fn detect_test_command(workdir: &Path) -> &'static str {
    if workdir.join("Cargo.toml").exists() {
        "cargo test"
    } else if workdir.join("package.json").exists() {
        "npm test"
    } else if workdir.join("pyproject.toml").exists() || workdir.join("setup.py").exists() {
        "pytest"
    } else {
        "make test"
    }
}

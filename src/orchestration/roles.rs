//! Keyword-based role assignment with an optional fallback.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::core::task::{MatchMethod, Task};
use crate::Result;

/// Role given when nothing else matches.
pub const DEFAULT_ROLE: &str = "developer";

/// One keyword rule. Keywords match as case-insensitive substrings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRule {
    pub role: String,
    pub keywords: Vec<String>,
}

impl RoleRule {
    pub fn new(role: &str, keywords: &[&str]) -> Self {
        Self {
            role: role.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// Longest keyword of this rule found in `haystack` (already lowercase).
    fn longest_match(&self, haystack: &str) -> Option<&str> {
        self.keywords
            .iter()
            .map(|k| k.as_str())
            .filter(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
            .max_by_key(|k| k.chars().count())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleAssignment {
    pub role: String,
    pub match_method: MatchMethod,
    pub match_details: String,
}

impl RoleAssignment {
    pub fn apply(&self, task: &mut Task) {
        task.role = Some(self.role.clone());
        task.match_method = Some(self.match_method);
        task.match_details = Some(self.match_details.clone());
    }
}

/// What a fallback classifier decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSuggestion {
    pub role: String,
    pub reasoning: String,
}

/// Classifier consulted when no keyword rule matches, typically an LLM.
pub trait RoleFallback: Send + Sync {
    fn suggest<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Option<RoleSuggestion>>>;
}

pub struct RoleAssigner {
    rules: Vec<RoleRule>,
    fallback: Option<Box<dyn RoleFallback>>,
}

impl RoleAssigner {
    pub fn new(rules: Vec<RoleRule>) -> Self {
        Self {
            rules,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Box<dyn RoleFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Match `text` against the rules only.
    ///
    /// The rule with the longest matching keyword wins; equal lengths are
    /// broken by role name so the result never depends on rule order.
    pub fn match_rules(&self, text: &str) -> Option<RoleAssignment> {
        let haystack = text.to_lowercase();
        let (rule, keyword) = self
            .rules
            .iter()
            .filter_map(|rule| rule.longest_match(&haystack).map(|k| (rule, k)))
            .min_by(|(ra, ka), (rb, kb)| {
                kb.chars()
                    .count()
                    .cmp(&ka.chars().count())
                    .then_with(|| ra.role.cmp(&rb.role))
            })?;
        Some(RoleAssignment {
            role: rule.role.clone(),
            match_method: MatchMethod::Rule,
            match_details: format!("matched keyword \"{}\"", keyword),
        })
    }

    pub async fn assign(&self, task: &Task) -> RoleAssignment {
        let text = task.text();
        if let Some(assignment) = self.match_rules(&text) {
            return assignment;
        }

        if let Some(fallback) = &self.fallback {
            match fallback.suggest(&text).await {
                Ok(Some(suggestion)) => {
                    return RoleAssignment {
                        role: suggestion.role,
                        match_method: MatchMethod::Llm,
                        match_details: suggestion.reasoning,
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(task = %task.id, error = %e, "role fallback failed");
                }
            }
        }

        RoleAssignment {
            role: DEFAULT_ROLE.to_string(),
            match_method: MatchMethod::Rule,
            match_details: "default role: no rule matched".to_string(),
        }
    }

    /// Assign roles to every task that does not already carry one.
    pub async fn assign_all(&self, tasks: &mut [Task]) {
        for task in tasks.iter_mut() {
            if task.role.is_some() {
                continue;
            }
            let assignment = self.assign(task).await;
            tracing::debug!(
                task = %task.id,
                role = %assignment.role,
                method = %assignment.match_method,
                "role assigned"
            );
            assignment.apply(task);
        }
    }
}

pub fn default_rules() -> Vec<RoleRule> {
    vec![
        RoleRule::new(
            "developer",
            &["implement", "build", "add", "create", "fix", "refactor", "feature"],
        ),
        RoleRule::new(
            "tester",
            &["test", "unit test", "integration test", "coverage", "qa", "verify"],
        ),
        RoleRule::new(
            "reviewer",
            &["review", "code review", "audit", "inspect", "lint"],
        ),
        RoleRule::new(
            "architect",
            &["design", "architecture", "schema", "interface", "plan"],
        ),
        RoleRule::new(
            "documenter",
            &["document", "documentation", "readme", "docs", "changelog"],
        ),
    ]
}

//! Masking of sensitive values in event payloads.
//!
//! Agent stderr, requirements and restatements can carry credentials. Every
//! payload passes through a `Redactor` before it reaches stdout or the save
//! file. A pattern masks three things: matching text inside strings, the
//! value half of `key=value` / `key: value` pairs whose key matches, and
//! whole values stored under a matching object key.

use regex::{Captures, Regex, RegexBuilder};
use serde_json::Value;

use crate::{Error, Result};

pub const MASK: &str = "[REDACTED]";

/// Patterns used when the config does not list its own.
pub const DEFAULT_PATTERNS: [&str; 9] = [
    r"sk-[a-z0-9\-_]{8,}",
    r"api[-_]?key",
    r"access[-_]?key",
    r"secret[-_]?key",
    r"token",
    r"password",
    r"passwd",
    r"pwd",
    r"authorization",
];

/// Object keys whose whole value is an environment dump.
const ENV_KEYS: [&str; 8] = [
    "env",
    "envs",
    "environment",
    "envvars",
    "processenv",
    "process_env",
    "envsnapshot",
    "environmentsnapshot",
];

#[derive(Debug, Clone)]
struct Pattern {
    text: Regex,
    pair: Regex,
}

#[derive(Debug, Clone, Default)]
pub struct Redactor {
    patterns: Vec<Pattern>,
}

impl Redactor {
    /// Compile `patterns` as case-insensitive regexes.
    ///
    /// # Errors
    /// `InvalidInput` naming the first pattern that does not compile.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| compile(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Mask sensitive content in `value` in place.
    pub fn redact(&self, value: &mut Value) {
        if self.is_empty() {
            return;
        }
        match value {
            Value::String(s) => {
                if let Some(masked) = self.redact_str(s) {
                    *s = masked;
                }
            }
            Value::Array(items) => items.iter_mut().for_each(|v| self.redact(v)),
            Value::Object(map) => {
                for (key, v) in map.iter_mut() {
                    if self.matches_key(key) {
                        *v = Value::String(MASK.to_string());
                    } else if is_env_key(key) {
                        mask_env(v);
                    } else {
                        self.redact(v);
                    }
                }
            }
            _ => {}
        }
    }

    /// Masked copy of `text`, or `None` when nothing matched.
    fn redact_str(&self, text: &str) -> Option<String> {
        let mut result = text.to_string();
        for pattern in &self.patterns {
            result = pattern
                .pair
                .replace_all(&result, |caps: &Captures| {
                    let raw = &caps[3];
                    let quoted = raw.len() > 1
                        && ((raw.starts_with('"') && raw.ends_with('"'))
                            || (raw.starts_with('\'') && raw.ends_with('\'')));
                    if quoted {
                        let quote = &raw[..1];
                        format!("{}{}{quote}{MASK}{quote}", &caps[1], &caps[2])
                    } else {
                        format!("{}{}{MASK}", &caps[1], &caps[2])
                    }
                })
                .into_owned();
            result = pattern.text.replace_all(&result, MASK).into_owned();
        }
        (result != text).then_some(result)
    }

    fn matches_key(&self, key: &str) -> bool {
        self.patterns.iter().any(|p| p.text.is_match(key))
    }
}

fn compile(source: &str) -> Result<Pattern> {
    let build = |pattern: &str| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::InvalidInput(format!("invalid redaction pattern {source}: {e}")))
    };
    Ok(Pattern {
        text: build(source)?,
        pair: build(&format!(r#"({source})(\s*[=:]\s*)("[^"]*"|'[^']*'|[^\s,;]+)"#))?,
    })
}

fn is_env_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ENV_KEYS.contains(&key.as_str())
}

fn mask_env(value: &mut Value) {
    match value {
        Value::Array(items) => {
            for item in items {
                *item = Value::String(MASK.to_string());
            }
        }
        Value::Null => {}
        other => *other = Value::String(MASK.to_string()),
    }
}

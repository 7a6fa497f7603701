use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

pub const MASK: &str = "***MASKED***";
pub const PATH_VAR: &str = "PATH";

/// Where a resolved value was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum ValueSource {
    Extras(String),
    BaseField(String),
    Default,
    DerivedFromHost,
    SearchPath,
}

impl fmt::Display for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSource::Extras(key) => write!(f, "extras[{}]", key),
            ValueSource::BaseField(key) => write!(f, "attribute {}", key),
            ValueSource::Default => f.write_str("default"),
            ValueSource::DerivedFromHost => f.write_str("derived from host"),
            ValueSource::SearchPath => f.write_str("tool dir + inherited PATH"),
        }
    }
}

/// The flat environment handed to every stage. Read-only once built; values
/// of secret variables are masked in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ResolvedEnvironment {
    vars: BTreeMap<String, String>,
    sources: BTreeMap<String, ValueSource>,
    secret_vars: BTreeSet<String>,
    tool_dir: Option<PathBuf>,
}

impl ResolvedEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, name: &str, value: String, source: ValueSource, secret: bool) {
        self.vars.insert(name.to_string(), value);
        self.sources.insert(name.to_string(), source);
        if secret {
            self.secret_vars.insert(name.to_string());
        }
    }

    pub(crate) fn set_tool_dir(&mut self, dir: Option<PathBuf>) {
        self.tool_dir = dir;
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn search_path(&self) -> Option<&str> {
        self.get(PATH_VAR)
    }

    pub fn tool_dir(&self) -> Option<&Path> {
        self.tool_dir.as_deref()
    }

    pub fn source(&self, name: &str) -> Option<&ValueSource> {
        self.sources.get(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn is_secret(&self, name: &str) -> bool {
        self.secret_vars.contains(name)
    }

    /// Variables to overlay on a child process environment
    pub fn overlay(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Copy of the variables with secret values replaced by a mask
    pub fn redacted(&self) -> BTreeMap<String, String> {
        self.vars
            .iter()
            .map(|(name, value)| {
                let shown = if self.is_secret(name) {
                    MASK.to_string()
                } else {
                    value.clone()
                };
                (name.clone(), shown)
            })
            .collect()
    }

    /// Mask secret values wherever they appear in `text`
    pub fn mask_secrets(&self, text: &str) -> String {
        let mut masked = text.to_string();
        for name in &self.secret_vars {
            if let Some(value) = self.vars.get(name) {
                if !value.trim().is_empty() {
                    masked = masked.replace(value.as_str(), MASK);
                }
            }
        }
        masked
    }
}

impl fmt::Debug for ResolvedEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedEnvironment")
            .field("vars", &self.redacted())
            .field("tool_dir", &self.tool_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResolvedEnvironment {
        let mut env = ResolvedEnvironment::new();
        env.insert(
            "SNOWFLAKE_USER",
            "alice".to_string(),
            ValueSource::BaseField("login".to_string()),
            false,
        );
        env.insert(
            "SNOWFLAKE_PASSWORD",
            "hunter2".to_string(),
            ValueSource::BaseField("password".to_string()),
            true,
        );
        env
    }

    #[test]
    fn test_debug_masks_secrets() {
        let rendered = format!("{:?}", sample());
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains(MASK));
    }

    #[test]
    fn test_mask_secrets_in_text() {
        let env = sample();
        assert_eq!(
            env.mask_secrets("connecting as alice with hunter2"),
            "connecting as alice with ***MASKED***"
        );
    }

    #[test]
    fn test_overlay_keeps_real_values() {
        let env = sample();
        assert_eq!(
            env.overlay().get("SNOWFLAKE_PASSWORD").map(String::as_str),
            Some("hunter2")
        );
        assert_eq!(
            env.redacted().get("SNOWFLAKE_PASSWORD").map(String::as_str),
            Some(MASK)
        );
    }

    #[test]
    fn test_value_source_display() {
        assert_eq!(
            ValueSource::Extras("extra__snowflake__role".to_string()).to_string(),
            "extras[extra__snowflake__role]"
        );
        assert_eq!(ValueSource::Default.to_string(), "default");
    }
}

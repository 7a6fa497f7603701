//! Runtime configuration for dbtflow.
//!
//! `PipelineConfig` is constructed once at startup and passed by reference to
//! the resolver and the orchestrator. Sources, lowest precedence first:
//!
//! 1. Hardcoded defaults
//! 2. Config file (`--config`, or `<config dir>/dbtflow/config.toml`)
//! 3. Environment variables (`DBTFLOW_*` prefix)
//! 4. CLI flags (applied by the binary)

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DbtflowError, ErrorCode, Result};

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const LOCK_FILE_NAME: &str = "dbtflow.lock";

/// Get the default location of the config file, if a home directory exists
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "dbtflow").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Lock file shared by every run of this user: the runtime dir where the
/// platform has one, else the local data dir, else the temp dir.
pub fn default_lock_path() -> PathBuf {
    match ProjectDirs::from("", "", "dbtflow") {
        Some(dirs) => dirs
            .runtime_dir()
            .unwrap_or_else(|| dirs.data_local_dir())
            .join(LOCK_FILE_NAME),
        None => std::env::temp_dir().join(LOCK_FILE_NAME),
    }
}

/// What to do when a run is triggered while another one is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunPolicy {
    #[default]
    Reject,
    Queue,
}

impl std::str::FromStr for RunPolicy {
    type Err = DbtflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(RunPolicy::Reject),
            "queue" => Ok(RunPolicy::Queue),
            other => Err(DbtflowError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!("unknown run policy '{}', expected 'reject' or 'queue'", other),
            )),
        }
    }
}

/// Values used when the connection record does not carry a field. None are
/// built in: warehouses, roles and databases are specific to an account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldDefaults {
    pub warehouse: Option<String>,
    pub role: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Name of the connection record to resolve
    pub connection_id: String,
    /// YAML or JSON file holding connection records
    pub connections_file: Option<PathBuf>,
    pub project_dir: PathBuf,
    pub profiles_dir: PathBuf,
    /// dbt target passed with `-t`
    pub target: String,
    pub dbt_executable: String,
    /// Directory prepended to PATH; defaults to the directory of this executable
    pub tool_bin_dir: Option<PathBuf>,
    pub query_tag: String,
    /// Prefix of the emitted variables, e.g. `SNOWFLAKE_` gives `SNOWFLAKE_ACCOUNT`
    pub env_prefix: String,
    /// Provider namespace some stores put in front of extras keys
    pub namespace_prefix: String,
    /// Domain suffix stripped from the host to derive the account; empty disables
    pub account_host_suffix: String,
    pub defaults: FieldDefaults,
    pub run_policy: RunPolicy,
    /// Lock file enforcing one run at a time across processes; see
    /// `lock_path` for the default
    pub lock_file: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            connection_id: "snowflake_default".to_string(),
            connections_file: None,
            project_dir: PathBuf::from("."),
            profiles_dir: PathBuf::from("."),
            target: "dev".to_string(),
            dbt_executable: "dbt".to_string(),
            tool_bin_dir: None,
            query_tag: "dbtflow".to_string(),
            env_prefix: "SNOWFLAKE_".to_string(),
            namespace_prefix: "extra__snowflake__".to_string(),
            account_host_suffix: ".snowflakecomputing.com".to_string(),
            defaults: FieldDefaults::default(),
            run_policy: RunPolicy::Reject,
            lock_file: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from an explicit file, or the default location when
    /// it exists, then apply `DBTFLOW_*` overrides from the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(DbtflowError::config_with_code(
                        ErrorCode::CONFIG_NOT_FOUND,
                        "configuration file not found",
                    )
                    .with_path(path));
                }
                Self::from_file(path)?
            }
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    tracing::debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.merge_env_vars(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DbtflowError::config("failed to read configuration file")
                .with_path(path)
                .with_source(e)
        })?;
        tracing::debug!("Loaded config file {}", path.display());
        Self::from_toml_str(&content).map_err(|e| e.with_path(path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            DbtflowError::config_with_code(ErrorCode::CONFIG_PARSE_ERROR, e.to_string())
        })
    }

    /// Apply `DBTFLOW_*` overrides. The lookup is injected so tests do not
    /// touch the process environment.
    pub fn merge_env_vars<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("DBTFLOW_CONNECTION_ID") {
            self.connection_id = value;
        }
        if let Some(value) = lookup("DBTFLOW_CONNECTIONS_FILE") {
            self.connections_file = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("DBTFLOW_PROJECT_DIR") {
            self.project_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("DBTFLOW_PROFILES_DIR") {
            self.profiles_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("DBTFLOW_TARGET") {
            self.target = value;
        }
        if let Some(value) = lookup("DBTFLOW_DBT_EXECUTABLE") {
            self.dbt_executable = value;
        }
        if let Some(value) = lookup("DBTFLOW_TOOL_BIN_DIR") {
            self.tool_bin_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("DBTFLOW_QUERY_TAG") {
            self.query_tag = value;
        }
        if let Some(value) = lookup("DBTFLOW_WAREHOUSE") {
            self.defaults.warehouse = Some(value);
        }
        if let Some(value) = lookup("DBTFLOW_ROLE") {
            self.defaults.role = Some(value);
        }
        if let Some(value) = lookup("DBTFLOW_DATABASE") {
            self.defaults.database = Some(value);
        }
        if let Some(value) = lookup("DBTFLOW_SCHEMA") {
            self.defaults.schema = Some(value);
        }
        if let Some(value) = lookup("DBTFLOW_RUN_POLICY") {
            self.run_policy = value.parse()?;
        }
        if let Some(value) = lookup("DBTFLOW_LOCK_FILE") {
            self.lock_file = Some(PathBuf::from(value));
        }
        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.lock_file.clone().unwrap_or_else(default_lock_path)
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("connection_id", &self.connection_id),
            ("target", &self.target),
            ("dbt_executable", &self.dbt_executable),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(DbtflowError::config_with_code(
                    ErrorCode::CONFIG_INVALID_VALUE,
                    format!("'{}' must not be empty", name),
                ));
            }
        }
        Ok(())
    }
}

use std::path::PathBuf;
use thiserror::Error;

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, DbtflowError>;

/// The unified error type for dbtflow
///
/// Configuration-time variants (`Config`, `ConnectionNotFound`,
/// `MissingRequiredField`) are raised before any stage runs. Run-time variants
/// carry the stage name so a failure can be diagnosed without rerunning.
#[derive(Error, Debug)]
pub enum DbtflowError {
    #[error("[E{code:04}] Configuration error: {message}")]
    Config {
        code: u16,
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{:04}] Connection '{conn_id}' not found", ErrorCode::CONNECTION_NOT_FOUND)]
    ConnectionNotFound { conn_id: String },

    #[error(
        "[E{:04}] Could not resolve required field '{field}' from the connection record",
        ErrorCode::MISSING_REQUIRED_FIELD
    )]
    MissingRequiredField { field: String },

    #[error("[E{:04}] Stage '{stage}' failed with exit code {exit_code}", ErrorCode::EXEC_SUBPROCESS_FAILED)]
    StageExecutionFailed { stage: String, exit_code: i32 },

    #[error("[E{:04}] Stage '{stage}' timed out", ErrorCode::EXEC_TIMEOUT)]
    StageTimedOut { stage: String },

    #[error("[E{:04}] Stage '{stage}' was terminated by signal {signal}", ErrorCode::EXEC_SIGNAL_RECEIVED)]
    StageSignalled { stage: String, signal: i32 },

    /// The stage's command could not be started or waited on. `code` comes
    /// from the underlying `ProcessError`.
    #[error("[E{code:04}] Stage '{stage}' could not run its command: {message}")]
    Process {
        stage: String,
        code: u16,
        message: String,
    },

    #[error("[E{:04}] Another pipeline run is already active", ErrorCode::RUN_IN_PROGRESS)]
    RunInProgress { holder: Option<String> },

    #[error("[E{:04}] Pipeline run cancelled during stage '{stage}'", ErrorCode::RUN_CANCELLED)]
    Cancelled { stage: String },
}

impl DbtflowError {
    /// Create a configuration error with default code
    pub fn config(message: impl Into<String>) -> Self {
        Self::config_with_code(ErrorCode::CONFIG_GENERIC, message)
    }

    /// Create a configuration error with specific code
    pub fn config_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
            path: None,
            source: None,
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
        }
    }

    pub fn connection_not_found(conn_id: impl Into<String>) -> Self {
        Self::ConnectionNotFound {
            conn_id: conn_id.into(),
        }
    }

    /// Attach the file a configuration error originated from
    pub fn with_path(mut self, file: impl Into<PathBuf>) -> Self {
        if let Self::Config { path, .. } = &mut self {
            *path = Some(file.into());
        }
        self
    }

    /// Add a source error to a configuration error
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        if let Self::Config { source: src, .. } = &mut self {
            *src = Some(source.into());
        }
        self
    }

    /// Get the error code
    pub fn code(&self) -> u16 {
        match self {
            Self::Config { code, .. } => *code,
            Self::ConnectionNotFound { .. } => ErrorCode::CONNECTION_NOT_FOUND,
            Self::MissingRequiredField { .. } => ErrorCode::MISSING_REQUIRED_FIELD,
            Self::StageExecutionFailed { .. } => ErrorCode::EXEC_SUBPROCESS_FAILED,
            Self::StageTimedOut { .. } => ErrorCode::EXEC_TIMEOUT,
            Self::StageSignalled { .. } => ErrorCode::EXEC_SIGNAL_RECEIVED,
            Self::Process { code, .. } => *code,
            Self::RunInProgress { .. } => ErrorCode::RUN_IN_PROGRESS,
            Self::Cancelled { .. } => ErrorCode::RUN_CANCELLED,
        }
    }

    /// True for errors raised while preparing a run, before any stage started
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::ConnectionNotFound { .. } | Self::MissingRequiredField { .. }
        )
    }

    /// Name of the stage this error is attributed to, if any
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::StageExecutionFailed { stage, .. }
            | Self::StageTimedOut { stage }
            | Self::StageSignalled { stage, .. }
            | Self::Process { stage, .. }
            | Self::Cancelled { stage } => Some(stage),
            _ => None,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::Config { message, path, .. } => match path {
                Some(p) => format!("Configuration problem in {}: {}", p.display(), message),
                None => format!("Configuration problem: {}", message),
            },
            Self::ConnectionNotFound { conn_id } => format!(
                "Connection '{}' was not found. Define it in the connections file or in DBTFLOW_CONN_{}",
                conn_id,
                conn_id.to_uppercase()
            ),
            Self::MissingRequiredField { field } => format!(
                "Could not determine '{}' from the connection. Populate it in the connection extras as '{}'",
                field, field
            ),
            Self::StageExecutionFailed { stage, exit_code } => {
                format!("Stage '{}' exited with code {}", stage, exit_code)
            }
            Self::StageTimedOut { stage } => format!("Stage '{}' ran past its timeout", stage),
            Self::StageSignalled { stage, signal } => {
                format!("Stage '{}' was killed by signal {}", stage, signal)
            }
            Self::Process { stage, message, .. } => {
                format!("Stage '{}' could not run its command: {}", stage, message)
            }
            Self::RunInProgress { holder } => match holder {
                Some(h) => format!("A pipeline run is already active ({})", h),
                None => "A pipeline run is already active".to_string(),
            },
            Self::Cancelled { stage } => format!("Run cancelled while '{}' was running", stage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_display_names_field() {
        let err = DbtflowError::missing_field("account");
        assert_eq!(err.code(), ErrorCode::MISSING_REQUIRED_FIELD);
        assert!(err.to_string().contains("'account'"));
        assert!(err.to_string().starts_with("[E1020]"));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_stage_failure_reports_stage_and_code() {
        let err = DbtflowError::StageExecutionFailed {
            stage: "dbt_run".to_string(),
            exit_code: 2,
        };
        assert_eq!(err.stage(), Some("dbt_run"));
        assert!(err.to_string().contains("dbt_run"));
        assert!(err.to_string().contains("exit code 2"));
        assert!(!err.is_configuration_error());
    }

    #[test]
    fn test_timeout_and_signal_have_own_codes() {
        let timed_out = DbtflowError::StageTimedOut {
            stage: "dbt_run".to_string(),
        };
        assert_eq!(timed_out.code(), ErrorCode::EXEC_TIMEOUT);
        assert!(timed_out.to_string().starts_with("[E4002]"));

        let signalled = DbtflowError::StageSignalled {
            stage: "dbt_test".to_string(),
            signal: 9,
        };
        assert_eq!(signalled.code(), ErrorCode::EXEC_SIGNAL_RECEIVED);
        assert_eq!(signalled.stage(), Some("dbt_test"));
    }

    #[test]
    fn test_process_error_keeps_underlying_code() {
        let err = DbtflowError::Process {
            stage: "dbt_debug".to_string(),
            code: ErrorCode::EXEC_COMMAND_NOT_FOUND,
            message: "Command not found: dbt".to_string(),
        };
        assert_eq!(err.code(), ErrorCode::EXEC_COMMAND_NOT_FOUND);
        assert_eq!(
            err.to_string(),
            "[E4001] Stage 'dbt_debug' could not run its command: Command not found: dbt"
        );
    }

    #[test]
    fn test_config_error_with_path() {
        let err = DbtflowError::config("bad value").with_path("/tmp/config.toml");
        assert_eq!(
            err.user_message(),
            "Configuration problem in /tmp/config.toml: bad value"
        );
    }

    #[test]
    fn test_connection_not_found_user_message() {
        let err = DbtflowError::connection_not_found("snowflake_default");
        assert!(err.user_message().contains("DBTFLOW_CONN_SNOWFLAKE_DEFAULT"));
        assert_eq!(err.code(), ErrorCode::CONNECTION_NOT_FOUND);
    }
}

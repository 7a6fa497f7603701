/// Error code registry for dbtflow
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors (raised before any stage runs)
/// - 4000-4999: Execution errors
/// - 5000-5999: Pipeline run errors
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_GENERIC: u16 = 1000;
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_PARSE_ERROR: u16 = 1002;
    pub const CONFIG_INVALID_VALUE: u16 = 1003;
    pub const CONNECTION_NOT_FOUND: u16 = 1010;
    pub const CONNECTION_INVALID: u16 = 1011;
    pub const MISSING_REQUIRED_FIELD: u16 = 1020;
    pub const DUPLICATE_STAGE: u16 = 1030;

    // Execution errors (4000-4999)
    pub const EXEC_GENERIC: u16 = 4000;
    pub const EXEC_COMMAND_NOT_FOUND: u16 = 4001;
    pub const EXEC_TIMEOUT: u16 = 4002;
    pub const EXEC_SUBPROCESS_FAILED: u16 = 4003;
    pub const EXEC_SIGNAL_RECEIVED: u16 = 4005;
    pub const EXEC_SPAWN_FAILED: u16 = 4007;
    pub const EXEC_OUTPUT_ERROR: u16 = 4008;

    // Pipeline run errors (5000-5999)
    pub const RUN_IN_PROGRESS: u16 = 5001;
    pub const RUN_CANCELLED: u16 = 5006;
    pub const RUN_LOCK_FAILED: u16 = 5007;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        ErrorCode::CONFIG_GENERIC => "General configuration error",
        ErrorCode::CONFIG_NOT_FOUND => "Configuration file not found",
        ErrorCode::CONFIG_PARSE_ERROR => "Configuration file could not be parsed",
        ErrorCode::CONFIG_INVALID_VALUE => "Invalid configuration value",
        ErrorCode::CONNECTION_NOT_FOUND => "Connection record not found in any store",
        ErrorCode::CONNECTION_INVALID => "Connection record is malformed",
        ErrorCode::MISSING_REQUIRED_FIELD => "Required field could not be resolved",
        ErrorCode::DUPLICATE_STAGE => "Pipeline defines the same stage name twice",

        ErrorCode::EXEC_GENERIC => "General execution error",
        ErrorCode::EXEC_COMMAND_NOT_FOUND => "Command not found",
        ErrorCode::EXEC_TIMEOUT => "Command execution timed out",
        ErrorCode::EXEC_SUBPROCESS_FAILED => "Subprocess exited with non-zero status",
        ErrorCode::EXEC_SIGNAL_RECEIVED => "Subprocess terminated by signal",
        ErrorCode::EXEC_SPAWN_FAILED => "Failed to spawn subprocess",
        ErrorCode::EXEC_OUTPUT_ERROR => "Failed to read subprocess output",

        ErrorCode::RUN_IN_PROGRESS => "Another pipeline run is already active",
        ErrorCode::RUN_CANCELLED => "Pipeline run was cancelled",
        ErrorCode::RUN_LOCK_FAILED => "Failed to acquire or release the run lock",

        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_ranges() {
        assert!((1000..2000).contains(&ErrorCode::CONNECTION_NOT_FOUND));
        assert!((1000..2000).contains(&ErrorCode::MISSING_REQUIRED_FIELD));
        assert!((4000..5000).contains(&ErrorCode::EXEC_SUBPROCESS_FAILED));
        assert!((5000..6000).contains(&ErrorCode::RUN_IN_PROGRESS));
    }

    #[test]
    fn test_describe_error_code() {
        assert_eq!(
            describe_error_code(ErrorCode::MISSING_REQUIRED_FIELD),
            "Required field could not be resolved"
        );
        assert_eq!(describe_error_code(4242), "Unknown error");
    }
}

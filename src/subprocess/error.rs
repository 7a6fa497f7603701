use crate::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Child {0} was not captured")]
    MissingPipe(&'static str),

    /// Raised by the mock runner for a command no expectation covers
    #[error("Unexpected command: {0}")]
    UnexpectedCommand(String),
}

impl ProcessError {
    pub fn code(&self) -> u16 {
        match self {
            ProcessError::CommandNotFound(_) => ErrorCode::EXEC_COMMAND_NOT_FOUND,
            ProcessError::SpawnFailed { .. } => ErrorCode::EXEC_SPAWN_FAILED,
            ProcessError::Io(_) | ProcessError::MissingPipe(_) => ErrorCode::EXEC_OUTPUT_ERROR,
            ProcessError::UnexpectedCommand(_) => ErrorCode::EXEC_GENERIC,
        }
    }
}

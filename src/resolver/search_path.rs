//! PATH augmentation so the external tool is found regardless of the shell
//! the pipeline was triggered from.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{DbtflowError, ErrorCode, Result};

/// Tool directory and inherited PATH, captured once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    tool_dir: Option<PathBuf>,
    inherited: Option<OsString>,
}

impl SearchPath {
    pub fn new(tool_dir: Option<PathBuf>, inherited: Option<OsString>) -> Self {
        Self {
            tool_dir,
            inherited,
        }
    }

    /// Capture from the running process. Without an override the tool
    /// directory is the one holding the current executable.
    pub fn capture(tool_bin_dir: Option<&Path>) -> Self {
        let tool_dir = match tool_bin_dir {
            Some(dir) => Some(dir.to_path_buf()),
            None => match std::env::current_exe() {
                Ok(exe) => exe.parent().map(Path::to_path_buf),
                Err(e) => {
                    tracing::warn!("Could not locate current executable: {}", e);
                    None
                }
            },
        };
        Self::new(tool_dir, std::env::var_os("PATH"))
    }

    pub fn tool_dir(&self) -> Option<&Path> {
        self.tool_dir.as_deref()
    }

    /// Tool directory followed by the inherited entries, joined with the
    /// platform separator. `None` when there is nothing to join.
    pub fn render(&self) -> Result<Option<String>> {
        let mut entries: Vec<PathBuf> = Vec::new();
        if let Some(dir) = &self.tool_dir {
            entries.push(dir.clone());
        }
        if let Some(inherited) = &self.inherited {
            entries.extend(std::env::split_paths(inherited));
        }
        if entries.is_empty() {
            return Ok(None);
        }

        let joined = std::env::join_paths(entries).map_err(|e| {
            DbtflowError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!("tool directory cannot be placed on PATH: {}", e),
            )
        })?;
        Ok(Some(joined.to_string_lossy().into_owned()))
    }
}

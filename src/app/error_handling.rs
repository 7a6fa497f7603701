//! Error handling utilities

use tracing::error;

use crate::error::{describe_error_code, DbtflowError};

/// Report a fatal error on stderr and exit with status 1.
///
/// `DbtflowError`s are shown with their user message, prefixed by the failing
/// stage when there is one. With `-v` the code's category and the full cause
/// chain follow.
pub fn handle_fatal_error(error: anyhow::Error, verbose: u8) -> ! {
    error!("Fatal error: {:#}", error);
    eprint!("{}", fatal_message(&error, verbose));
    std::process::exit(1)
}

fn fatal_message(error: &anyhow::Error, verbose: u8) -> String {
    let mut out = String::new();
    let coded = error.downcast_ref::<DbtflowError>();

    match coded {
        Some(err) => {
            if let Some(stage) = err.stage() {
                out.push_str(&format!("Failed stage: {}\n", stage));
            }
            out.push_str(&format!("Error [E{:04}]: {}\n", err.code(), err.user_message()));
        }
        None => out.push_str(&format!("Error: {error}\n")),
    }

    if verbose >= 1 {
        if let Some(err) = coded {
            out.push_str(&format!(
                "\nE{:04}: {}\n",
                err.code(),
                describe_error_code(err.code())
            ));
        }
        out.push_str("\nError chain:\n");
        for (i, cause) in error.chain().enumerate() {
            out.push_str(&format!("  {}: {}\n", i, cause));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failure_names_the_stage() {
        let error = anyhow::Error::new(DbtflowError::StageTimedOut {
            stage: "dbt_run".to_string(),
        });
        let message = fatal_message(&error, 0);

        assert!(message.starts_with("Failed stage: dbt_run\nError [E4002]"));
        assert!(!message.contains("Error chain"));
    }

    #[test]
    fn test_verbose_adds_code_description_and_chain() {
        let error = anyhow::Error::new(DbtflowError::MissingRequiredField {
            field: "schema".to_string(),
        })
        .context("resolving environment");
        let message = fatal_message(&error, 1);

        assert!(message.contains("Error [E1020]"));
        assert!(message.contains("E1020: Required field could not be resolved"));
        assert!(message.contains("  0: resolving environment"));
        assert!(!message.contains("Failed stage"));
    }

    #[test]
    fn test_foreign_error_is_shown_plainly() {
        let message = fatal_message(&anyhow::anyhow!("disk full"), 1);
        assert!(message.starts_with("Error: disk full\n"));
        assert!(message.contains("  0: disk full"));
    }
}

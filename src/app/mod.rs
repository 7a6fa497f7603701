//! Application module
//!
//! Wiring shared by the CLI commands:
//! - Logging setup
//! - Fatal error reporting
//! - Connection lookup, resolution and pipeline runs

pub mod config;
pub mod error_handling;
pub mod logging;
pub mod runtime;

pub use config::AppConfig;
pub use error_handling::handle_fatal_error;
pub use logging::init_logging;
pub use runtime::{default_store, resolve_environment, run_pipeline};

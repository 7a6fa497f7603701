//! # dbtflow
//!
//! Turns a stored Snowflake connection record into the environment dbt
//! expects, then runs the dbt stages one after another, stopping at the first
//! failure.
//!
//! ## Usage
//!
//! ```bash
//! dbtflow run [--connection snowflake_default] [--project-dir DIR] [--target dev]
//! dbtflow env [--json] [--show-secrets]
//! dbtflow stages
//! ```
//!
//! ## Modules
//!
//! - `app` - Wiring used by the CLI: logging, fatal errors, lookup → resolve → run
//! - `config` - `PipelineConfig` from TOML with `DBTFLOW_*` overrides
//! - `connection` - Connection records and the stores they are looked up in
//! - `error` - `DbtflowError` and its stable error codes
//! - `pipeline` - Stages, run limiter, cancellation and the orchestrator
//! - `resolver` - Connection record → flat environment variables
//! - `subprocess` - Structured process execution with a mock for tests
pub mod app;
pub mod config;
pub mod connection;
pub mod error;
pub mod pipeline;
pub mod resolver;
pub mod subprocess;

pub use config::PipelineConfig;
pub use error::{DbtflowError, Result};

//! Subprocess abstraction: structured command descriptors, a Tokio-backed
//! runner with line streaming, and a mock runner for tests.

pub mod error;
pub mod mock;
pub mod runner;


pub use error::ProcessError;
pub use mock::{MockCommandConfig, MockProcessRunner, RecordedCall};
pub use runner::{
    ExitStatus, LineStream, ProcessCommand, ProcessOutput, ProcessRunner, ProcessStream,
    StatusFuture, TokioProcessRunner,
};

use std::sync::Arc;

/// Shared handle to the runner the rest of the crate spawns through
#[derive(Clone)]
pub struct SubprocessManager {
    runner: Arc<dyn ProcessRunner>,
}

impl SubprocessManager {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    pub fn production() -> Self {
        Self::new(Arc::new(TokioProcessRunner))
    }

    /// Manager backed by a mock, plus a handle for setting expectations
    pub fn mock() -> (Self, MockProcessRunner) {
        let mock = MockProcessRunner::new();
        (Self::new(Arc::new(mock.clone())), mock)
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        Arc::clone(&self.runner)
    }
}

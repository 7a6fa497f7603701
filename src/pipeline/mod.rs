//! Fail-fast sequential pipeline execution.

pub mod cancel;
pub mod limiter;
pub mod orchestrator;
pub mod stage;
pub mod state;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use limiter::{RunLimiter, RunLockFile, RunLockInfo, RunPermit};
pub use orchestrator::PipelineOrchestrator;
pub use stage::{ArgTemplate, CommandTemplate, Pipeline, PipelinePaths, PipelineStage};
pub use state::{FailureReason, RunReport, RunStatus, StageReport, StageState};

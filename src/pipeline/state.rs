//! Per-stage and per-run state.
//!
//! A stage goes `Pending → Running → Succeeded | Failed`, or straight from
//! `Pending` to `Skipped` once an earlier stage failed. There is no path back
//! to `Running`: retries are fixed at zero.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::error::DbtflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageState {
    pub fn can_transition_to(&self, next: StageState) -> bool {
        matches!(
            (self, next),
            (StageState::Pending, StageState::Running)
                | (StageState::Pending, StageState::Skipped)
                | (StageState::Running, StageState::Succeeded)
                | (StageState::Running, StageState::Failed)
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Succeeded => "succeeded",
            StageState::Failed => "failed",
            StageState::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// Why a stage failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    ExitStatus { exit_code: i32 },
    TimedOut,
    Signal { signal: i32 },
    /// The process could not be started or waited on
    Process { code: u16, message: String },
    Cancelled,
}

impl FailureReason {
    /// The error reported for a stage that failed for this reason
    pub fn into_error(self, stage: &str) -> DbtflowError {
        let stage = stage.to_string();
        match self {
            FailureReason::ExitStatus { exit_code } => {
                DbtflowError::StageExecutionFailed { stage, exit_code }
            }
            FailureReason::TimedOut => DbtflowError::StageTimedOut { stage },
            FailureReason::Signal { signal } => DbtflowError::StageSignalled { stage, signal },
            FailureReason::Process { code, message } => DbtflowError::Process {
                stage,
                code,
                message,
            },
            FailureReason::Cancelled => DbtflowError::Cancelled { stage },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub state: StageState,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Display form of each command that was started
    pub commands: Vec<String>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl StageReport {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: StageState::Pending,
            exit_code: None,
            failure: None,
            started_at: None,
            finished_at: None,
            commands: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    fn transition(&mut self, next: StageState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                "Ignoring invalid transition of stage '{}': {} -> {}",
                self.name,
                self.state,
                next
            );
            return;
        }
        tracing::debug!("Stage '{}': {} -> {}", self.name, self.state, next);
        self.state = next;
    }

    pub fn mark_running(&mut self) {
        self.transition(StageState::Running);
        self.started_at = Some(Utc::now());
    }

    pub fn mark_succeeded(&mut self) {
        self.transition(StageState::Succeeded);
        self.exit_code = Some(0);
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: FailureReason) {
        self.transition(StageState::Failed);
        self.exit_code = match &reason {
            FailureReason::ExitStatus { exit_code } => Some(*exit_code),
            _ => None,
        };
        self.failure = Some(reason);
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_skipped(&mut self) {
        self.transition(StageState::Skipped);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageReport>,
    pub failed_stage: Option<String>,
}

impl RunReport {
    pub fn new<'a>(pipeline: &str, stage_names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline: pipeline.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            stages: stage_names.into_iter().map(StageReport::pending).collect(),
            failed_stage: None,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn state_of(&self, name: &str) -> Option<StageState> {
        self.stage(name).map(|stage| stage.state)
    }

    /// Close the run: any stage still pending is skipped
    pub(crate) fn finish(&mut self, failed_stage: Option<String>) {
        for stage in self.stages.iter_mut() {
            if stage.state == StageState::Pending {
                stage.mark_skipped();
            }
        }
        self.status = if failed_stage.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.failed_stage = failed_stage;
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// 0 iff every stage succeeded
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    /// The error describing the first failing stage, if the run failed
    pub fn failure(&self) -> Option<DbtflowError> {
        let name = self.failed_stage.as_ref()?;
        let reason = self.stage(name)?.failure.clone()?;
        Some(reason.into_error(name))
    }

    /// Turn a failed run into its error, keeping successful reports as-is
    pub fn into_result(self) -> Result<RunReport, DbtflowError> {
        match self.failure() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

use futures::StreamExt;
use tracing::{error, info, warn};

use super::cancel::CancelToken;
use super::limiter::RunLimiter;
use super::stage::{Pipeline, PipelinePaths, PipelineStage};
use super::state::{FailureReason, RunReport, StageReport};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::resolver::ResolvedEnvironment;
use crate::subprocess::{ExitStatus, LineStream, ProcessCommand, ProcessStream, SubprocessManager};

/// Runs pipelines stage by stage, failing fast
pub struct PipelineOrchestrator {
    subprocess: SubprocessManager,
    limiter: RunLimiter,
}

impl PipelineOrchestrator {
    pub fn new(subprocess: SubprocessManager, limiter: RunLimiter) -> Self {
        Self {
            subprocess,
            limiter,
        }
    }

    /// Limiter policy and lock file taken from config. The lock file is what
    /// keeps separate `dbtflow` processes from running at the same time.
    pub fn from_config(subprocess: SubprocessManager, config: &PipelineConfig) -> Self {
        let limiter = RunLimiter::new(config.run_policy).with_lock_file(config.lock_path());
        Self::new(subprocess, limiter)
    }

    /// Execute every stage in order.
    ///
    /// A stage failure is not an `Err`: the returned report carries the
    /// failed and skipped stages, and `RunReport::failure` turns it into the
    /// matching error. `Err` is reserved for runs that never started, such as
    /// a rejection by the run limiter.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        env: &ResolvedEnvironment,
        paths: &PipelinePaths,
        mut cancel: CancelToken,
    ) -> Result<RunReport> {
        let mut report = RunReport::new(
            pipeline.name(),
            pipeline.stages().iter().map(|stage| stage.name.as_str()),
        );
        // A queued run can still be cancelled; the first stage then records it
        let _permit = tokio::select! {
            permit = self.limiter.acquire(report.run_id) => Some(permit?),
            _ = cancel.cancelled() => None,
        };

        info!(
            "Starting run {} of '{}' ({} stages) in {}",
            report.run_id,
            pipeline.name(),
            pipeline.stages().len(),
            paths.project_dir.display()
        );

        let mut failed_stage = None;
        for (stage, stage_report) in pipeline.stages().iter().zip(report.stages.iter_mut()) {
            stage_report.mark_running();

            if cancel.is_cancelled() {
                warn!("Run cancelled before stage '{}' started", stage.name);
                stage_report.mark_failed(FailureReason::Cancelled);
                failed_stage = Some(stage.name.clone());
                break;
            }

            match self
                .run_stage(stage, env, paths, &mut cancel, stage_report)
                .await
            {
                Ok(()) => {
                    info!("Stage '{}' succeeded", stage.name);
                    stage_report.mark_succeeded();
                }
                Err(reason) => {
                    error!("Stage '{}' failed: {:?}", stage.name, reason);
                    stage_report.mark_failed(reason);
                    failed_stage = Some(stage.name.clone());
                    break;
                }
            }
        }

        report.finish(failed_stage);
        match &report.failed_stage {
            Some(stage) => error!("Run {} failed at stage '{}'", report.run_id, stage),
            None => info!("Run {} succeeded", report.run_id),
        }
        Ok(report)
    }

    async fn run_stage(
        &self,
        stage: &PipelineStage,
        env: &ResolvedEnvironment,
        paths: &PipelinePaths,
        cancel: &mut CancelToken,
        report: &mut StageReport,
    ) -> std::result::Result<(), FailureReason> {
        if stage.is_marker() {
            return Ok(());
        }

        let overlay = stage.requires_environment.then_some(env);
        for template in &stage.commands {
            let command = template.render(paths, overlay);
            let line = command.display_line();
            info!("[{}] $ {}", stage.name, env.mask_secrets(&line));
            report.commands.push(line);

            self.run_command(command, &stage.name, env, cancel, report)
                .await?;
        }
        Ok(())
    }

    /// Stream one process to the log and the stage report. Cancellation drops
    /// the status future, which kills the process.
    async fn run_command(
        &self,
        command: ProcessCommand,
        stage: &str,
        env: &ResolvedEnvironment,
        cancel: &mut CancelToken,
        report: &mut StageReport,
    ) -> std::result::Result<(), FailureReason> {
        let ProcessStream {
            stdout,
            stderr,
            status,
        } = match self.subprocess.runner().spawn(command).await {
            Ok(stream) => stream,
            Err(e) => {
                let message = env.mask_secrets(&e.to_string());
                error!("[{}] {}", stage, message);
                return Err(FailureReason::Process {
                    code: e.code(),
                    message,
                });
            }
        };

        let mut out_lines = Vec::new();
        let mut err_lines = Vec::new();
        let outcome = {
            let work = async {
                let (_, _, status) = tokio::join!(
                    forward_lines(stdout, stage, env, &mut out_lines, false),
                    forward_lines(stderr, stage, env, &mut err_lines, true),
                    status
                );
                status
            };
            tokio::select! {
                status = work => Some(status),
                _ = cancel.cancelled() => None,
            }
        };
        report.stdout.append(&mut out_lines);
        report.stderr.append(&mut err_lines);

        match outcome {
            Some(Ok(ExitStatus::Success)) => Ok(()),
            Some(Ok(ExitStatus::Error(exit_code))) => Err(FailureReason::ExitStatus { exit_code }),
            Some(Ok(ExitStatus::Timeout)) => {
                warn!("[{}] Command timed out", stage);
                Err(FailureReason::TimedOut)
            }
            Some(Ok(ExitStatus::Signal(signal))) => {
                warn!("[{}] Command terminated by signal {}", stage, signal);
                Err(FailureReason::Signal { signal })
            }
            Some(Err(e)) => {
                error!("[{}] Lost track of the process: {}", stage, e);
                Err(FailureReason::Process {
                    code: e.code(),
                    message: env.mask_secrets(&e.to_string()),
                })
            }
            None => {
                warn!("[{}] Cancellation requested; process killed", stage);
                Err(FailureReason::Cancelled)
            }
        }
    }
}

async fn forward_lines(
    mut lines: LineStream,
    stage: &str,
    env: &ResolvedEnvironment,
    sink: &mut Vec<String>,
    is_stderr: bool,
) {
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                let line = env.mask_secrets(&line);
                if is_stderr {
                    warn!("[{}] {}", stage, line);
                } else {
                    info!("[{}] {}", stage, line);
                }
                sink.push(line);
            }
            Err(e) => {
                warn!("[{}] Failed to read process output: {}", stage, e);
                break;
            }
        }
    }
}

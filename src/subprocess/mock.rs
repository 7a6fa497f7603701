//! In-memory `ProcessRunner` for tests: canned output per program, recorded
//! invocations, and a count of how many mocked processes overlap.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::error::ProcessError;
use super::runner::{ExitStatus, LineStream, ProcessCommand, ProcessRunner, ProcessStream};

/// One recorded invocation of the mock runner
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub command: ProcessCommand,
    pub invoked_at: Instant,
}

type ArgsMatcher = Box<dyn Fn(&[String]) -> bool + Send + Sync>;

struct Expectation {
    program: String,
    args: Option<ArgsMatcher>,
    status: ExitStatus,
    stdout: String,
    stderr: String,
    delay: Option<Duration>,
    remaining: Option<usize>,
}

impl Expectation {
    fn matches(&self, command: &ProcessCommand) -> bool {
        self.program == command.program
            && self.args.as_ref().map_or(true, |matcher| matcher(&command.args))
    }
}

#[derive(Default)]
struct MockState {
    expectations: Vec<Expectation>,
    calls: Vec<RecordedCall>,
    active: usize,
    max_active: usize,
}

#[derive(Clone, Default)]
pub struct MockProcessRunner {
    state: Arc<Mutex<MockState>>,
}

/// Builder returned by `expect_command`; registered on `finish`
pub struct MockCommandConfig {
    runner: MockProcessRunner,
    expectation: Expectation,
}

/// Marks a mocked process as alive until dropped
struct Alive(Arc<Mutex<MockState>>);

impl Drop for Alive {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.active -= 1;
        }
    }
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// First matching expectation wins. Defaults to a silent success.
    pub fn expect_command(&mut self, program: &str) -> MockCommandConfig {
        MockCommandConfig {
            runner: self.clone(),
            expectation: Expectation {
                program: program.to_string(),
                args: None,
                status: ExitStatus::Success,
                stdout: String::new(),
                stderr: String::new(),
                delay: None,
                remaining: None,
            },
        }
    }

    pub fn verify_called(&self, program: &str, times: usize) -> bool {
        self.state()
            .calls
            .iter()
            .filter(|call| call.command.program == program)
            .count()
            == times
    }

    pub fn get_call_history(&self) -> Vec<ProcessCommand> {
        self.state().calls.iter().map(|call| call.command.clone()).collect()
    }

    /// Calls with the instant each one started, in invocation order
    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    /// Highest number of mocked processes alive at the same time
    pub fn max_concurrent(&self) -> usize {
        self.state().max_active
    }

    pub fn active_count(&self) -> usize {
        self.state().active
    }
}

fn lines(text: &str) -> LineStream {
    let lines: Vec<Result<String, ProcessError>> =
        text.lines().map(|line| Ok(line.to_string())).collect();
    Box::pin(futures::stream::iter(lines))
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn spawn(&self, command: ProcessCommand) -> Result<ProcessStream, ProcessError> {
        let mut state = self.state();
        state.calls.push(RecordedCall {
            command: command.clone(),
            invoked_at: Instant::now(),
        });

        let expectation = state
            .expectations
            .iter_mut()
            .find(|expectation| expectation.matches(&command) && expectation.remaining != Some(0))
            .ok_or_else(|| ProcessError::UnexpectedCommand(command.display_line()))?;
        if let Some(remaining) = expectation.remaining.as_mut() {
            *remaining -= 1;
        }

        let stdout = lines(&expectation.stdout);
        let stderr = lines(&expectation.stderr);
        let status = expectation.status;
        let delay = expectation.delay;

        state.active += 1;
        state.max_active = state.max_active.max(state.active);
        let alive = Alive(Arc::clone(&self.state));

        Ok(ProcessStream {
            stdout,
            stderr,
            status: Box::pin(async move {
                let _alive = alive;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(status)
            }),
        })
    }
}

impl MockCommandConfig {
    pub fn with_args<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.expectation.args = Some(Box::new(matcher));
        self
    }

    pub fn returns_stdout(mut self, stdout: &str) -> Self {
        self.expectation.stdout = stdout.to_string();
        self
    }

    pub fn returns_stderr(mut self, stderr: &str) -> Self {
        self.expectation.stderr = stderr.to_string();
        self
    }

    pub fn returns_exit_code(mut self, code: i32) -> Self {
        self.expectation.status = if code == 0 {
            ExitStatus::Success
        } else {
            ExitStatus::Error(code)
        };
        self
    }

    pub fn returns_success(self) -> Self {
        self.returns_exit_code(0)
    }

    /// Keep the mocked process alive for `delay` before it exits
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.expectation.delay = Some(delay);
        self
    }

    /// Match at most `n` invocations
    pub fn times(mut self, n: usize) -> Self {
        self.expectation.remaining = Some(n);
        self
    }

    pub fn finish(self) {
        self.runner.state().expectations.push(self.expectation);
    }
}

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use futures::Future;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::error::ProcessError;

/// A structured process invocation: program, argument vector, working
/// directory and an environment overlay applied on top of the inherited
/// environment. No shell is involved, so argument values are passed verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(name, value)| (name.into(), value.into())));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Kill the process if it has not exited after `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shell-quoted rendering of the command line, for logs only
    pub fn display_line(&self) -> String {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Timeout,
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    /// Numeric exit code; `None` when the process never exited on its own
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            ExitStatus::Timeout | ExitStatus::Signal(_) => None,
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if status.success() {
            return ExitStatus::Success;
        }
        if let Some(code) = status.code() {
            return ExitStatus::Error(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitStatus::Signal(signal);
            }
        }
        ExitStatus::Error(1)
    }
}

pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, ProcessError>> + Send>>;
pub type StatusFuture = Pin<Box<dyn Future<Output = Result<ExitStatus, ProcessError>> + Send>>;

/// Collected result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// A running process: its output as line streams and a future resolving to
/// its exit status. Dropping `status` before it resolves kills the process.
pub struct ProcessStream {
    pub stdout: LineStream,
    pub stderr: LineStream,
    pub status: StatusFuture,
}

impl ProcessStream {
    /// Drain both streams and wait for exit
    pub async fn collect(self) -> Result<ProcessOutput, ProcessError> {
        let (stdout, stderr, status) = tokio::join!(
            self.stdout.collect::<Vec<_>>(),
            self.stderr.collect::<Vec<_>>(),
            self.status
        );
        Ok(ProcessOutput {
            status: status?,
            stdout: stdout.into_iter().collect::<Result<_, _>>()?,
            stderr: stderr.into_iter().collect::<Result<_, _>>()?,
        })
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Start the process; output and exit status are consumed through the
    /// returned stream
    async fn spawn(&self, command: ProcessCommand) -> Result<ProcessStream, ProcessError>;
}

/// Runs real processes on the Tokio runtime
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    fn configure(command: &ProcessCommand) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            // Inherited environment stays; overlay values win on name clashes
            .envs(&command.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        // Own process group: a terminal Ctrl-C reaches us only, and
        // cancellation signals the group as a whole
        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn line_stream<R>(reader: R) -> LineStream
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let lines = BufReader::new(reader).lines();
        Box::pin(futures::stream::unfold(Some(lines), |state| async move {
            let mut lines = state?;
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(line), Some(lines))),
                Ok(None) => None,
                Err(e) => Some((Err(ProcessError::Io(e)), None)),
            }
        }))
    }

    fn status_future(mut child: tokio::process::Child, timeout: Option<Duration>) -> StatusFuture {
        // Armed until the child exits on its own: dropping the future early,
        // even before its first poll, takes the whole group down
        let mut group = ProcessGroup::of(&child);
        Box::pin(async move {
            let status = match timeout {
                None => child.wait().await?,
                Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        tracing::warn!("Process {:?} exceeded {:?}, killing it", child.id(), limit);
                        group.terminate().await;
                        child.kill().await?;
                        return Ok(ExitStatus::Timeout);
                    }
                },
            };
            group.release();
            Ok(status.into())
        })
    }
}

const TERMINATE_GRACE: Duration = Duration::from_millis(100);

/// Process group led by a spawned child. Descendants stay in it unless they
/// move themselves out, so signalling the group reaches wrapper scripts and
/// whatever they started.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &tokio::process::Child) -> Self {
        Self { pgid: child.id() }
    }

    /// SIGTERM, then SIGKILL once the grace period is over
    async fn terminate(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;
            signal_group(pgid, Signal::SIGTERM);
            tokio::time::sleep(TERMINATE_GRACE).await;
            signal_group(pgid, Signal::SIGKILL);
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }

    /// The child exited by itself; leave the group alone
    fn release(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            #[cfg(unix)]
            signal_group(pgid, nix::sys::signal::Signal::SIGKILL);
            #[cfg(not(unix))]
            let _ = pgid;
        }
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) => tracing::debug!("Sent {:?} to process group {}", signal, pgid),
        // Everyone in the group is already gone
        Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!("Failed to signal process group {}: {}", pgid, e),
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn spawn(&self, command: ProcessCommand) -> Result<ProcessStream, ProcessError> {
        tracing::debug!("Spawning: {}", command.display_line());
        // Names only: overlay values may carry credentials
        tracing::trace!(
            "Overlay variables: [{}], working dir: {:?}",
            command.env.keys().map(String::as_str).collect::<Vec<_>>().join(", "),
            command.working_dir
        );

        let mut child = Self::configure(&command).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::CommandNotFound(command.program.clone())
            } else {
                ProcessError::SpawnFailed {
                    command: command.display_line(),
                    source: e,
                }
            }
        })?;

        let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ProcessError::MissingPipe("stderr"))?;

        Ok(ProcessStream {
            stdout: Self::line_stream(stdout),
            stderr: Self::line_stream(stderr),
            status: Self::status_future(child, command.timeout),
        })
    }
}

//! Generic supervision of an external executable
//!
//! A [`ProcessSupervisor`] makes sure a binary is on disk, launches it, feeds
//! it an optional standard-input payload and watches its output streams for a
//! readiness signal described declaratively as a list of [`ReadinessMatcher`]s.
//! It knows nothing about what the executable is; the engine and tunnel
//! supervisors are thin specializations on top of it.

use crate::fetch::{BinaryFetcher, FetchError};
use regex::Regex;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Delay between granting execute permission and spawning
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Errors raised while launching a process
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid readiness pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Lifecycle of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Nothing launched yet, or launch in progress
    Spawning,
    /// Process created, readiness not yet observed
    Running,
    /// A readiness matcher fired
    Ready,
    /// Process creation failed
    Errored,
    /// Process exited
    Exited,
}

/// Output channel of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// A line pattern that signals readiness, with an optional extractor.
///
/// If the extractor has a capture group, the first group is the extracted
/// value; otherwise the whole extractor match is.
#[derive(Debug, Clone)]
pub struct ReadinessMatcher {
    label: &'static str,
    stream: OutputStream,
    pattern: Regex,
    extractor: Option<Regex>,
}

impl ReadinessMatcher {
    pub fn new(label: &'static str, stream: OutputStream, pattern: &str) -> Result<Self, SupervisorError> {
        Ok(Self {
            label,
            stream,
            pattern: Regex::new(pattern)?,
            extractor: None,
        })
    }

    pub fn with_extractor(mut self, extractor: &str) -> Result<Self, SupervisorError> {
        self.extractor = Some(Regex::new(extractor)?);
        Ok(self)
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn stream(&self) -> OutputStream {
        self.stream
    }

    /// Test a single output line
    pub fn evaluate(&self, line: &str) -> Option<ReadySignal> {
        if !self.pattern.is_match(line) {
            return None;
        }

        let extracted = self.extractor.as_ref().and_then(|re| {
            let caps = re.captures(line)?;
            let value = caps.get(1).or_else(|| caps.get(0))?;
            Some(value.as_str().trim().to_string())
        });

        Some(ReadySignal {
            label: self.label,
            extracted,
        })
    }
}

/// What a matcher produced when it fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadySignal {
    pub label: &'static str,
    pub extracted: Option<String>,
}

/// Result of waiting for a process to become ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready(ReadySignal),
    /// The process could not be started
    Failed(String),
    /// No matcher fired within the configured bound
    TimedOut(Duration),
}

impl ReadinessOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessOutcome::Ready(_))
    }
}

/// A launched child process, owned by exactly one supervisor
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the process has already terminated
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Send SIGTERM (kill on other platforms), then SIGKILL after `grace_period`
    pub async fn terminate(mut self, name: &str, grace_period: Duration) {
        if let Some(pid) = self.child.id() {
            info!(process = name, pid, "Sending SIGTERM");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = self.child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(process = name, ?status, "Process exited");
            }
            Ok(Err(e)) => {
                warn!(process = name, error = %e, "Error waiting for process to exit");
            }
            Err(_) => {
                warn!(
                    process = name,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Supervises one external executable
pub struct ProcessSupervisor {
    name: &'static str,
    state: ProcessState,
    settle_delay: Duration,
    log_output: bool,
}

impl ProcessSupervisor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: ProcessState::Spawning,
            settle_delay: DEFAULT_SETTLE_DELAY,
            log_output: false,
        }
    }

    /// Log output lines that no matcher consumed at debug level
    pub fn with_output_logging(mut self, enabled: bool) -> Self {
        self.log_output = enabled;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Record that the process behind `handle` has exited, if it has
    pub fn refresh(&mut self, handle: &mut ProcessHandle) -> ProcessState {
        if let Some(status) = handle.try_exit_status() {
            if self.state != ProcessState::Exited {
                debug!(process = self.name, ?status, "Process has exited");
            }
            self.state = ProcessState::Exited;
        }
        self.state
    }

    /// Make sure `path` exists, downloading it with `fetcher` if missing.
    ///
    /// Never fails: acquisition problems are logged and reported as `false`,
    /// leaving the caller free to attempt a launch anyway.
    pub async fn ensure_present<F: BinaryFetcher>(&self, path: &Path, fetcher: &F) -> bool {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            info!(process = self.name, path = %path.display(), "Binary already present");
            return true;
        }

        let result: Result<(), FetchError> = async {
            let bytes = fetcher
                .fetch(std::env::consts::OS, std::env::consts::ARCH)
                .await?;
            tokio::fs::write(path, &bytes).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(process = self.name, path = %path.display(), "Binary downloaded");
                true
            }
            Err(e) => {
                warn!(process = self.name, path = %path.display(), error = %e, "Binary download failed");
                false
            }
        }
    }

    /// Set the execute bits on `path` (POSIX only), then wait a short settle delay
    pub async fn grant_execute(&self, path: &Path) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let result = async {
                let mut permissions = tokio::fs::metadata(path).await?.permissions();
                permissions.set_mode(permissions.mode() | 0o111);
                tokio::fs::set_permissions(path, permissions).await
            }
            .await;

            match result {
                Ok(()) => debug!(process = self.name, path = %path.display(), "Execute permission granted"),
                Err(e) => debug!(process = self.name, path = %path.display(), error = %e, "Could not grant execute permission"),
            }
            tokio::time::sleep(self.settle_delay).await;
        }

        #[cfg(not(unix))]
        let _ = path;
    }

    /// Start the process.
    ///
    /// When `stdin_payload` is given it is written in full from a background
    /// task and the stream is then closed; otherwise stdin is null.
    pub fn launch<I, S>(
        &mut self,
        path: &Path,
        args: I,
        stdin_payload: Option<Vec<u8>>,
    ) -> Result<ProcessHandle, SupervisorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.state = ProcessState::Spawning;

        let mut cmd = Command::new(path);
        cmd.args(args);
        cmd.stdin(if stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // A handle dropped without terminate() must not leave the child behind
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.state = ProcessState::Errored;
                return Err(SupervisorError::Spawn {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        let pid = child.id();
        info!(process = self.name, pid, "Process spawned");

        if let (Some(mut stdin), Some(payload)) = (child.stdin.take(), stdin_payload) {
            let name = self.name;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    warn!(process = name, error = %e, "Failed to write standard input");
                    return;
                }
                if let Err(e) = stdin.shutdown().await {
                    debug!(process = name, error = %e, "Failed to close standard input");
                }
            });
        }

        self.state = ProcessState::Running;

        Ok(ProcessHandle {
            pid,
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
        })
    }

    /// Wait for the first matcher to fire on the handle's output.
    ///
    /// Each matcher fires at most once and the outcome resolves exactly once.
    /// A process that exits without ever matching leaves the wait pending, so
    /// pass `timeout` to bound it. Output keeps being drained after readiness
    /// so the child never blocks on a full pipe.
    pub async fn await_readiness(
        &mut self,
        handle: &mut ProcessHandle,
        matchers: Vec<ReadinessMatcher>,
        timeout: Option<Duration>,
    ) -> ReadinessOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (stdout_matchers, stderr_matchers): (Vec<_>, Vec<_>) = matchers
            .into_iter()
            .partition(|m| m.stream() == OutputStream::Stdout);

        if let Some(stdout) = handle.stdout.take() {
            tokio::spawn(scan_lines(
                self.name,
                OutputStream::Stdout,
                stdout,
                stdout_matchers,
                tx.clone(),
                self.log_output,
            ));
        }
        if let Some(stderr) = handle.stderr.take() {
            tokio::spawn(scan_lines(
                self.name,
                OutputStream::Stderr,
                stderr,
                stderr_matchers,
                tx.clone(),
                self.log_output,
            ));
        }
        drop(tx);

        let name = self.name;
        let wait = async move {
            match rx.recv().await {
                Some(signal) => signal,
                None => {
                    warn!(process = name, "Output closed without a readiness signal");
                    std::future::pending().await
                }
            }
        };

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(signal) => ReadinessOutcome::Ready(signal),
                Err(_) => ReadinessOutcome::TimedOut(limit),
            },
            None => ReadinessOutcome::Ready(wait.await),
        };

        if outcome.is_ready() {
            self.state = ProcessState::Ready;
        } else {
            self.refresh(handle);
        }
        outcome
    }
}

/// Read `reader` line by line until EOF, reporting each matcher's first hit
async fn scan_lines<R>(
    name: &'static str,
    stream: OutputStream,
    reader: R,
    matchers: Vec<ReadinessMatcher>,
    tx: mpsc::UnboundedSender<ReadySignal>,
    log_output: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut fired = vec![false; matchers.len()];
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(process = name, %stream, error = %e, "Error reading process output");
                break;
            }
        }
        // Output is not guaranteed to be UTF-8; a bad byte must not end the scan
        let decoded = String::from_utf8_lossy(&buf);
        let line = decoded.trim_end_matches(|c| c == '\n' || c == '\r');

        let mut consumed = false;
        for (matcher, fired) in matchers.iter().zip(fired.iter_mut()) {
            if *fired {
                continue;
            }
            if let Some(signal) = matcher.evaluate(line) {
                *fired = true;
                consumed = true;
                // The receiver is gone once readiness has resolved
                let _ = tx.send(signal);
            }
        }

        if !consumed {
            if log_output {
                debug!(process = name, %stream, "{}", line);
            } else {
                trace!(process = name, %stream, "{}", line);
            }
        }
    }

    trace!(process = name, %stream, "Output stream closed");
}

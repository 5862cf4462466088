use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::error::{Result, RunnerError};
use crate::ssh::connection::Connection;
use crate::ssh::transport::{OutputChunk, OutputStream, RemoteSession};

/// Idle wait between reads in the blocking worker.
const WORKER_POLL: Duration = Duration::from_millis(20);

/// How long an interrupted run waits for the worker to close its channel.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Receives output chunks as they arrive.
pub type OutputSink = mpsc::UnboundedSender<OutputChunk>;

/// Per-call knobs for [`CommandExecutor::run`].
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Overrides the executor's default deadline.
    pub timeout: Option<Duration>,
    /// Forward every chunk here while the command runs.
    pub sink: Option<OutputSink>,
    /// Abandon the command when this token fires.
    pub cancel: Option<CancellationToken>,
    /// Fed to the command's standard input. Never logged.
    pub stdin: Option<Vec<u8>>,
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("timeout", &self.timeout)
            .field("streaming", &self.sink.is_some())
            .field("cancel", &self.cancel.is_some())
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn streaming(mut self, sink: OutputSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// How a command run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The remote process finished. The status is missing when the server
    /// did not report one.
    Exited(Option<i32>),
    /// The watchdog deadline passed first.
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub completion: Completion,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn exit_code(&self) -> Option<i32> {
        match self.completion {
            Completion::Exited(code) => code,
            _ => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.completion == Completion::TimedOut
    }

    pub fn cancelled(&self) -> bool {
        self.completion == Completion::Cancelled
    }

    /// Exit status 0, or no status at all with nothing on stderr.
    pub fn succeeded(&self) -> bool {
        match self.completion {
            Completion::Exited(Some(code)) => code == 0,
            Completion::Exited(None) => self.stderr.trim().is_empty(),
            Completion::TimedOut | Completion::Cancelled => false,
        }
    }

    /// First non-blank stdout line, trimmed.
    pub fn first_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
    }
}

#[derive(Default)]
struct Capture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Capture {
    fn record(&mut self, chunk: OutputChunk, sink: Option<&OutputSink>) {
        if let Some(sink) = sink {
            let _ = sink.send(chunk.clone());
        }
        match chunk.stream {
            OutputStream::Stdout => self.stdout.extend_from_slice(&chunk.data),
            OutputStream::Stderr => self.stderr.extend_from_slice(&chunk.data),
        }
    }

    fn finish(self, completion: Completion, elapsed: Duration) -> CommandOutput {
        CommandOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            completion,
            elapsed,
        }
    }
}

/// Runs commands on an open connection under a watchdog.
///
/// The channel is read on a blocking worker thread that forwards chunks to
/// the caller. The caller checks the deadline every `watchdog_interval`;
/// once it passes, the worker is told to close the channel and whatever was
/// captured so far is returned. The run does not return until the worker
/// has let go of the channel or [`STOP_GRACE`] has passed, in which case the
/// connection is marked broken. Closing the channel does not guarantee the
/// remote process is killed.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `command` and capture its output.
    pub async fn run(
        &self,
        conn: &Connection,
        command: &str,
        options: RunOptions,
    ) -> Result<CommandOutput> {
        let session = conn.session()?;
        let target = conn.target_id();
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let started = Instant::now();

        if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            tracing::debug!(host = %target, command, "Command cancelled before start");
            return Ok(Capture::default().finish(Completion::Cancelled, Duration::ZERO));
        }

        tracing::debug!(
            host = %target,
            command,
            timeout_secs = timeout.as_secs_f64(),
            "Running remote command"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let worker_command = command.to_string();
        let stdin = options.stdin.clone();
        let mut worker = tokio::task::spawn_blocking(move || {
            drive_channel(
                session.as_ref(),
                &worker_command,
                stdin.as_deref(),
                &tx,
                &worker_stop,
            )
        });

        let mut capture = Capture::default();
        let mut ticker = tokio::time::interval(self.config.watchdog_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let interrupted = loop {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(chunk) => capture.record(chunk, options.sink.as_ref()),
                    None => break None,
                },
                _ = ticker.tick() => {
                    if started.elapsed() >= timeout {
                        break Some(Completion::TimedOut);
                    }
                }
                _ = cancelled(options.cancel.as_ref()) => break Some(Completion::Cancelled),
            }
        };

        let completion = match interrupted {
            Some(completion) => {
                stop.store(true, Ordering::Release);
                // The channel must be gone before the connection is handed
                // to the next command.
                match tokio::time::timeout(STOP_GRACE, &mut worker).await {
                    Ok(Ok(WorkerExit::Refused(_) | WorkerExit::Broken)) | Ok(Err(_)) => {
                        conn.mark_broken()
                    }
                    Ok(Ok(_)) => {}
                    Err(_) => {
                        tracing::warn!(
                            host = %target,
                            grace_secs = STOP_GRACE.as_secs_f64(),
                            "Command worker did not stop in time"
                        );
                        conn.mark_broken();
                    }
                }
                while let Ok(chunk) = rx.try_recv() {
                    capture.record(chunk, options.sink.as_ref());
                }
                tracing::warn!(
                    host = %target,
                    command,
                    outcome = ?completion,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "Command abandoned; remote process may still be running"
                );
                completion
            }
            None => {
                let exit = worker
                    .await
                    .map_err(|e| RunnerError::Execution(format!("command worker failed: {e}")))?;
                match exit {
                    WorkerExit::Exited(code) => Completion::Exited(code),
                    WorkerExit::Stopped => Completion::Exited(None),
                    WorkerExit::Broken => {
                        conn.mark_broken();
                        Completion::Exited(None)
                    }
                    WorkerExit::Refused(e) => {
                        conn.mark_broken();
                        return Err(e);
                    }
                }
            }
        };

        let output = capture.finish(completion, started.elapsed());
        tracing::debug!(
            host = %target,
            command,
            outcome = ?output.completion,
            elapsed_secs = output.elapsed.as_secs_f64(),
            "Remote command finished"
        );
        Ok(output)
    }

    /// Run a short helper command quietly with the probe deadline.
    pub async fn probe(&self, conn: &Connection, command: &str) -> Result<CommandOutput> {
        self.run(conn, command, RunOptions::with_timeout(self.config.probe_timeout))
            .await
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// How the blocking worker left its channel.
enum WorkerExit {
    Exited(Option<i32>),
    /// Told to stop, or nobody is listening any more.
    Stopped,
    /// The session would not start the command.
    Refused(RunnerError),
    /// Reading failed part way through.
    Broken,
}

/// Blocking loop that owns the exec channel. The channel is dropped before
/// this returns.
fn drive_channel(
    session: &dyn RemoteSession,
    command: &str,
    stdin: Option<&[u8]>,
    tx: &mpsc::UnboundedSender<OutputChunk>,
    stop: &AtomicBool,
) -> WorkerExit {
    let mut channel = match session.exec(command, stdin) {
        Ok(channel) => channel,
        Err(e) => return WorkerExit::Refused(e),
    };

    loop {
        if stop.load(Ordering::Acquire) {
            channel.close();
            return WorkerExit::Stopped;
        }

        match channel.read() {
            Ok(Some(chunk)) => {
                if tx.send(chunk).is_err() {
                    channel.close();
                    return WorkerExit::Stopped;
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                let _ = tx.send(OutputChunk::stderr(format!("read failed: {e}")));
                channel.close();
                return WorkerExit::Broken;
            }
        }

        if channel.is_eof() {
            while let Ok(Some(chunk)) = channel.read() {
                let _ = tx.send(chunk);
            }
            break;
        }

        std::thread::sleep(WORKER_POLL);
    }

    WorkerExit::Exited(channel.exit_status())
}

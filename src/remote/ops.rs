use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::Instant;

use crate::error::{Result, RunnerError};
use crate::remote::executor::{CommandExecutor, CommandOutput, RunOptions};
use crate::remote::os::{self, RemoteOs};
use crate::remote::sync::FileSync;
use crate::ssh::connection::{Connection, ConnectionManager};
use crate::ssh::params::ConnectionParams;

/// How long a local ping may take before it counts as a failure.
pub const PING_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_COUNT: u32 = 5;

/// Defaults for [`HostOps::wait_until_online`].
pub const ONLINE_TIMEOUT: Duration = Duration::from_secs(300);
pub const ONLINE_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Higher-level host operations built from commands and transfers.
#[derive(Debug, Clone)]
pub struct HostOps {
    executor: CommandExecutor,
    sync: FileSync,
}

impl HostOps {
    pub fn new(executor: CommandExecutor) -> Self {
        let sync = FileSync::new(executor.clone());
        Self { executor, sync }
    }

    /// Upload a Python script to a scratch directory and run it with the
    /// host's interpreter.
    pub async fn run_script(
        &self,
        conn: &Connection,
        script: &Path,
        options: RunOptions,
    ) -> Result<CommandOutput> {
        let remote_path = self.sync.send_file(conn, script, None).await?;
        let os = os::resolve(&self.executor, conn).await;
        if !os.is_known() {
            return Err(RunnerError::Execution(format!(
                "no interpreter known for {}: unknown operating system",
                conn.target_id()
            )));
        }
        let caps = os.capabilities();
        let command = format!("{} {}", caps.interpreter, caps.quote(&remote_path));
        self.executor.run(conn, &command, options).await
    }

    /// Run a PowerShell snippet. Linux hosts need `pwsh` on the PATH.
    pub async fn run_powershell(
        &self,
        conn: &Connection,
        script: &str,
        options: RunOptions,
    ) -> Result<CommandOutput> {
        let os = os::resolve(&self.executor, conn).await;
        let launcher = match os {
            RemoteOs::Windows => "powershell",
            RemoteOs::Linux => {
                let which = self.executor.probe(conn, "which pwsh").await?;
                if which.first_line().is_none() {
                    return Err(RunnerError::Execution(format!(
                        "pwsh is not installed on {}",
                        conn.target_id()
                    )));
                }
                "pwsh"
            }
            RemoteOs::Unknown => {
                return Err(RunnerError::Execution(format!(
                    "cannot launch PowerShell on {}: unknown operating system",
                    conn.target_id()
                )))
            }
        };
        let command = os.capabilities().powershell_command(launcher, script);
        self.executor.run(conn, &command, options).await
    }

    /// Ask the host to restart. The session usually drops while the command
    /// runs, so the output is informational only. On Unix the password is
    /// fed to `sudo` on standard input, never on the command line.
    pub async fn reboot(&self, conn: &Connection) -> Result<CommandOutput> {
        let os = os::resolve(&self.executor, conn).await;
        let caps = os.capabilities();
        let mut options = RunOptions::with_timeout(self.executor.config().probe_timeout);
        let command = match (os, conn.params().password()) {
            (RemoteOs::Windows, _) => caps.reboot,
            (_, Some(password)) => {
                options = options.with_stdin(format!("{password}\n"));
                caps.reboot
            }
            (_, None) => "sudo -n reboot",
        };
        tracing::warn!(host = %conn.target_id(), os = %os, "Rebooting remote host");
        self.executor.run(conn, command, options).await
    }

    /// Keep trying to connect until the host answers or `timeout` elapses.
    /// Only transient failures are retried.
    pub async fn wait_until_online(
        manager: &ConnectionManager,
        params: &ConnectionParams,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Connection> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match manager.open(params.clone()).await {
                Ok(conn) => {
                    tracing::info!(host = %params.target_id(), attempt, "Host is online");
                    return Ok(conn);
                }
                Err(e) if e.is_retryable() && started.elapsed() + interval < timeout => {
                    tracing::info!(
                        host = %params.target_id(),
                        attempt,
                        error = %e,
                        "Host not reachable yet, retrying"
                    );
                    tokio::time::sleep(interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Ping `host` from the local machine. Returns whether it answered.
pub async fn ping(host: &str, count: u32) -> Result<bool> {
    let count_flag = if cfg!(windows) { "-n" } else { "-c" };
    tracing::info!(host, count, "Pinging host");

    let count_arg = count.to_string();
    let mut command = Command::new("ping");
    command
        .args([count_flag, count_arg.as_str(), host])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(PING_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => {
            let reachable = output.status.success();
            tracing::debug!(
                host,
                reachable,
                stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                "Ping finished"
            );
            Ok(reachable)
        }
        Ok(Err(e)) => Err(RunnerError::Execution(format!("failed to run ping: {e}"))),
        Err(_) => {
            tracing::warn!(host, timeout_secs = PING_TIMEOUT.as_secs(), "Ping timed out");
            Ok(false)
        }
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::remote::executor::CommandExecutor;
use crate::remote::ops::HostOps;
use crate::remote::sync::FileSync;
use crate::scheduler::job::{ExecutionRequest, JobKind, JobOutcome};
use crate::scheduler::store::JobStore;
use crate::scheduler::tracker::{JobContext, Scheduler};
use crate::ssh::connection::{Connection, ConnectionManager};
use crate::ssh::libssh::Ssh2Transport;
use crate::ssh::params::ConnectionParams;
use crate::ssh::pool::{ConnectionPool, SharedConnection};
use crate::ssh::transport::Transport;

enum Attempt {
    Done(Result<JobOutcome>),
    /// The session was closed or dead before the work reached the host.
    SessionLost(SharedConnection, RunnerError),
}

/// Wires the connection pool, executor, file sync and scheduler together.
#[derive(Clone)]
pub struct Runner {
    pool: Arc<ConnectionPool>,
    executor: CommandExecutor,
    sync: FileSync,
    ops: HostOps,
    scheduler: Scheduler,
}

impl Runner {
    pub fn new(config: RunnerConfig, store: Arc<dyn JobStore>) -> Self {
        Self::with_transport(config, Arc::new(Ssh2Transport), store)
    }

    pub fn with_transport(
        config: RunnerConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let manager = ConnectionManager::with_transport(transport, config.connect);
        let executor = CommandExecutor::new(config.executor);
        Self {
            pool: Arc::new(ConnectionPool::new(manager)),
            sync: FileSync::new(executor.clone()),
            ops: HostOps::new(executor.clone()),
            executor,
            scheduler: Scheduler::new(config.scheduler, store),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn sync(&self) -> &FileSync {
        &self.sync
    }

    pub fn ops(&self) -> &HostOps {
        &self.ops
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Queue a request. What runs depends on `request.kind`:
    /// commands and tool invocations run `command` as-is, scripts upload
    /// and run the local file named by `command`, transfers upload the
    /// local file or directory named by `command`.
    pub async fn submit(&self, request: ExecutionRequest) -> Uuid {
        let runner = self.clone();
        self.scheduler
            .submit(request, move |ctx| async move { runner.perform(ctx).await })
            .await
    }

    pub async fn submit_command(&self, target: ConnectionParams, command: impl Into<String>) -> Uuid {
        self.submit(ExecutionRequest::command(target, command)).await
    }

    /// Upload `script` and run it with the host's interpreter.
    pub async fn submit_script(&self, target: ConnectionParams, script: &Path) -> Uuid {
        self.submit(ExecutionRequest::script(target, script.display().to_string()))
            .await
    }

    /// Upload a file or directory. The finished job's output is the remote path.
    pub async fn submit_transfer(
        &self,
        target: ConnectionParams,
        local: &Path,
        remote_dir: Option<&str>,
    ) -> Uuid {
        let mut request = ExecutionRequest::transfer(target, local.display().to_string());
        if let Some(dir) = remote_dir {
            request = request.with_destination(dir);
        }
        self.submit(request).await
    }

    /// Run the job, once more on a fresh connection if the pooled session
    /// turns out to be dead before the work reached the host.
    async fn perform(&self, ctx: JobContext) -> Result<JobOutcome> {
        let target = &ctx.request.target;
        let (stale, error) = match self.attempt(&ctx).await {
            Attempt::Done(result) => return result,
            Attempt::SessionLost(stale, error) => (stale, error),
        };
        self.pool.discard(target, &stale).await;
        if ctx.cancel.is_cancelled() {
            return Err(error);
        }

        tracing::warn!(
            job_id = %ctx.job_id,
            host = %target.target_id(),
            error = %error,
            "SSH session lost, retrying on a fresh connection"
        );
        match self.attempt(&ctx).await {
            Attempt::Done(result) => result,
            Attempt::SessionLost(stale, error) => {
                self.pool.discard(target, &stale).await;
                Err(error)
            }
        }
    }

    async fn attempt(&self, ctx: &JobContext) -> Attempt {
        let shared = match self.pool.acquire(&ctx.request.target).await {
            Ok(shared) => shared,
            Err(e) => return Attempt::Done(Err(e)),
        };
        let conn = tokio::select! {
            conn = shared.lock() => conn,
            _ = ctx.cancel.cancelled() => {
                let outcome = JobOutcome::failure("", "cancelled while waiting for the connection");
                return Attempt::Done(Ok(outcome));
            }
        };

        let result = self.run_job(ctx, &conn).await;
        match result {
            Err(e @ (RunnerError::NotConnected(_) | RunnerError::SessionLost { .. })) => {
                drop(conn);
                Attempt::SessionLost(shared, e)
            }
            result => Attempt::Done(result),
        }
    }

    async fn run_job(&self, ctx: &JobContext, conn: &Connection) -> Result<JobOutcome> {
        match ctx.request.kind {
            JobKind::Command | JobKind::ToolInvocation => {
                let output = self
                    .executor
                    .run(conn, &ctx.request.command, ctx.run_options())
                    .await?;
                Ok(JobOutcome::from(output))
            }
            JobKind::Script => {
                let script = PathBuf::from(&ctx.request.command);
                let output = self.ops.run_script(conn, &script, ctx.run_options()).await?;
                Ok(JobOutcome::from(output))
            }
            JobKind::Transfer => {
                let local = PathBuf::from(&ctx.request.command);
                let destination = ctx.request.destination.as_deref();
                let remote = if tokio::fs::metadata(&local).await.is_ok_and(|m| m.is_dir()) {
                    self.sync.send_directory(conn, &local, destination).await?
                } else {
                    self.sync.send_file(conn, &local, destination).await?
                };
                Ok(JobOutcome::success(remote))
            }
        }
    }

    /// Stop the scheduler and close every pooled connection.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.pool.close_all().await;
    }
}

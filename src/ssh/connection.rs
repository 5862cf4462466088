use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::ConnectConfig;
use crate::error::{Result, RunnerError};
use crate::remote::os::RemoteOs;
use crate::ssh::libssh::Ssh2Transport;
use crate::ssh::params::ConnectionParams;
use crate::ssh::transport::{RemoteSession, Transport};

/// An authenticated session to one host, plus what we learned about it.
pub struct Connection {
    params: ConnectionParams,
    session: Option<Arc<dyn RemoteSession>>,
    remote_os: OnceLock<RemoteOs>,
    broken: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.params.target_id())
            .field("open", &self.is_open())
            .field("broken", &self.is_broken())
            .field("remote_os", &self.remote_os.get())
            .finish()
    }
}

impl Connection {
    /// Wrap an already authenticated session.
    pub fn from_session(params: ConnectionParams, session: Arc<dyn RemoteSession>) -> Self {
        Self {
            params,
            session: Some(session),
            remote_os: OnceLock::new(),
            broken: AtomicBool::new(false),
        }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn target_id(&self) -> String {
        self.params.target_id()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// The session can no longer be trusted: a channel could not be
    /// opened, a read failed, or a reader thread outlived its command.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn mark_broken(&self) {
        if !self.broken.swap(true, Ordering::AcqRel) {
            tracing::warn!(host = %self.target_id(), "SSH session marked broken");
        }
    }

    /// The live session, or `NotConnected` once closed or broken.
    pub fn session(&self) -> Result<Arc<dyn RemoteSession>> {
        if self.is_broken() {
            return Err(RunnerError::NotConnected(self.target_id()));
        }
        self.session
            .clone()
            .ok_or_else(|| RunnerError::NotConnected(self.target_id()))
    }

    pub fn cached_os(&self) -> Option<RemoteOs> {
        self.remote_os.get().copied()
    }

    /// Remember a detection result. `Unknown` is never cached so a later
    /// call can probe again.
    pub fn cache_os(&self, os: RemoteOs) {
        if os != RemoteOs::Unknown {
            let _ = self.remote_os.set(os);
        }
    }

    /// Tear the session down. Calling this on a closed connection is a no-op.
    pub async fn close(&mut self) {
        let Some(session) = self.session.take() else {
            tracing::debug!(host = %self.target_id(), "Connection already closed");
            return;
        };
        let target = self.target_id();
        if let Err(e) = tokio::task::spawn_blocking(move || session.disconnect()).await {
            tracing::warn!(host = %target, error = %e, "Disconnect task failed");
        }
        tracing::info!(host = %target, "SSH connection closed");
    }
}

/// Opens and closes connections through a pluggable transport.
#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ConnectConfig,
}

impl ConnectionManager {
    pub fn new(config: ConnectConfig) -> Self {
        Self::with_transport(Arc::new(Ssh2Transport), config)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, config: ConnectConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    /// Establish an authenticated session.
    pub async fn open(&self, params: ConnectionParams) -> Result<Connection> {
        let target = params.target_id();
        tracing::info!(host = %target, "Opening SSH connection");

        let transport = self.transport.clone();
        let config = self.config.clone();
        let connect_params = params.clone();
        let result = tokio::task::spawn_blocking(move || {
            transport.connect(&connect_params, &config)
        })
        .await
        .map_err(|e| RunnerError::Execution(format!("connect task failed: {e}")))?;

        match result {
            Ok(session) => {
                tracing::info!(host = %target, "SSH connection established");
                Ok(Connection::from_session(params, session))
            }
            Err(e) => {
                tracing::warn!(
                    host = %target,
                    error = %e,
                    retryable = e.is_retryable(),
                    "SSH connection failed"
                );
                Err(e)
            }
        }
    }

    pub async fn close(&self, connection: &mut Connection) {
        connection.close().await;
    }
}

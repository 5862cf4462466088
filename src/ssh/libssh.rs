//! `Transport` backed by libssh2 through the `ssh2` crate.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;

use ssh2::{Channel, HashType, Session, Sftp, Stream};

use crate::config::{ConnectConfig, HostKeyPolicy};
use crate::error::{Result, RunnerError};
use crate::ssh::params::{ConnectionParams, Credential};
use crate::ssh::transport::{FileTransfer, OutputChunk, RemoteChannel, RemoteSession, Transport};

const READ_BUFFER: usize = 8192;

#[derive(Debug, Clone, Copy, Default)]
pub struct Ssh2Transport;

impl Transport for Ssh2Transport {
    fn connect(
        &self,
        params: &ConnectionParams,
        config: &ConnectConfig,
    ) -> Result<Arc<dyn RemoteSession>> {
        let target = params.target_id();
        let tcp = open_tcp(params, config, &target)?;

        let mut session = Session::new().map_err(|e| RunnerError::Negotiation {
            target: target.clone(),
            reason: e.to_string(),
        })?;
        session.set_timeout(timeout_millis(config));
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| RunnerError::Negotiation {
            target: target.clone(),
            reason: e.to_string(),
        })?;

        verify_host_key(&session, &target, &config.host_key_policy)?;
        authenticate(&session, params, &target)?;

        // Command deadlines are enforced by the executor watchdog.
        session.set_timeout(0);
        if let Some(interval) = config.keepalive_interval {
            session.set_keepalive(true, interval.as_secs().max(1) as u32);
        }

        tracing::debug!(host = %target, "SSH session established");
        Ok(Arc::new(Ssh2Session { session, target }))
    }
}

fn timeout_millis(config: &ConnectConfig) -> u32 {
    u32::try_from(config.connect_timeout.as_millis()).unwrap_or(u32::MAX)
}

fn open_tcp(params: &ConnectionParams, config: &ConnectConfig, target: &str) -> Result<TcpStream> {
    let unreachable = |reason: String| RunnerError::Unreachable {
        target: target.to_string(),
        reason,
    };

    let addrs = (params.host.as_str(), params.port)
        .to_socket_addrs()
        .map_err(|e| unreachable(format!("address resolution failed: {e}")))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(unreachable(match last_error {
        Some(e) => e.to_string(),
        None => "no addresses resolved".to_string(),
    }))
}

fn verify_host_key(session: &Session, target: &str, policy: &HostKeyPolicy) -> Result<()> {
    let HostKeyPolicy::Fingerprint(expected) = policy else {
        return Ok(());
    };

    let actual = session
        .host_key_hash(HashType::Sha256)
        .map(hex)
        .unwrap_or_default();

    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(RunnerError::HostKeyMismatch {
            target: target.to_string(),
            expected: expected.clone(),
            actual,
        })
    }
}

fn authenticate(session: &Session, params: &ConnectionParams, target: &str) -> Result<()> {
    let auth_error = |reason: String| RunnerError::Authentication {
        target: target.to_string(),
        reason,
    };

    match &params.credential {
        Credential::Password(password) => session
            .userauth_password(&params.username, password)
            .map_err(|e| auth_error(e.to_string()))?,
        Credential::KeyFile { path, passphrase } => {
            if !path.exists() {
                return Err(auth_error(format!(
                    "key file {} does not exist",
                    path.display()
                )));
            }
            session
                .userauth_pubkey_file(&params.username, None, path, passphrase.as_deref())
                .map_err(|e| auth_error(e.to_string()))?
        }
    }

    if !session.authenticated() {
        return Err(auth_error("server did not accept the credentials".to_string()));
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

struct Ssh2Session {
    session: Session,
    target: String,
}

impl RemoteSession for Ssh2Session {
    fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<Box<dyn RemoteChannel>> {
        let lost = |reason: String| RunnerError::SessionLost {
            target: self.target.clone(),
            reason,
        };
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| lost(format!("failed to open channel: {e}")))?;
        channel
            .exec(command)
            .map_err(|e| lost(format!("failed to start command: {e}")))?;
        if let Some(input) = stdin {
            channel
                .write_all(input)
                .and_then(|()| channel.send_eof().map_err(io::Error::from))
                .map_err(|e| lost(format!("failed to send input: {e}")))?;
        }

        let stderr = channel.stderr();
        self.session.set_blocking(false);

        Ok(Box::new(Ssh2Channel {
            session: self.session.clone(),
            channel,
            stderr,
            closed: false,
        }))
    }

    fn open_sftp(&self) -> Result<Box<dyn FileTransfer>> {
        let sftp = self
            .session
            .sftp()
            .map_err(|e| RunnerError::SessionLost {
                target: self.target.clone(),
                reason: format!("failed to open SFTP channel: {e}"),
            })?;
        tracing::debug!(host = %self.target, "SFTP channel opened");
        Ok(Box::new(Ssh2FileTransfer {
            sftp,
            target: self.target.clone(),
        }))
    }

    fn disconnect(&self) {
        self.session.set_blocking(true);
        if let Err(e) = self.session.disconnect(None, "closing", None) {
            tracing::debug!(host = %self.target, error = %e, "Disconnect was not clean");
        }
    }
}

/// Exec channel read in non-blocking mode.
///
/// The session is non-blocking for exactly as long as this channel lives;
/// blocking mode is restored on drop so later SFTP calls behave normally.
/// Only one channel may be alive per session at a time: the executor joins
/// its reader thread before it hands the connection back, and marks the
/// connection broken when the thread does not stop.
struct Ssh2Channel {
    session: Session,
    channel: Channel,
    stderr: Stream,
    closed: bool,
}

fn read_available(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<usize>> {
    match reader.read(buf) {
        Ok(0) => Ok(None),
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

impl RemoteChannel for Ssh2Channel {
    fn read(&mut self) -> io::Result<Option<OutputChunk>> {
        let mut buf = [0u8; READ_BUFFER];
        if let Some(n) = read_available(&mut self.channel, &mut buf)? {
            return Ok(Some(OutputChunk::stdout(&buf[..n])));
        }
        if let Some(n) = read_available(&mut self.stderr, &mut buf)? {
            return Ok(Some(OutputChunk::stderr(&buf[..n])));
        }
        Ok(None)
    }

    fn is_eof(&mut self) -> bool {
        self.channel.eof()
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = self.channel.close();
            self.closed = true;
        }
    }

    fn exit_status(&mut self) -> Option<i32> {
        self.session.set_blocking(true);
        if self.channel.wait_close().is_err() {
            return None;
        }
        self.channel.exit_status().ok()
    }
}

impl Drop for Ssh2Channel {
    fn drop(&mut self) {
        self.session.set_blocking(true);
    }
}

struct Ssh2FileTransfer {
    sftp: Sftp,
    target: String,
}

impl FileTransfer for Ssh2FileTransfer {
    fn mkdir(&mut self, path: &str) -> io::Result<()> {
        let remote = Path::new(path);
        match self.sftp.mkdir(remote, 0o755) {
            Ok(()) => Ok(()),
            Err(e) => match self.sftp.stat(remote) {
                Ok(stat) if stat.is_dir() => Err(io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("{path} already exists"),
                )),
                _ => Err(io::Error::from(e)),
            },
        }
    }

    fn upload(&mut self, local: &Path, remote: &str) -> io::Result<u64> {
        let mut source = File::open(local)?;
        let mut dest = self.sftp.create(Path::new(remote)).map_err(io::Error::from)?;
        io::copy(&mut source, &mut dest)
    }

    fn download(&mut self, remote: &str, local: &Path) -> io::Result<u64> {
        let mut source = self.sftp.open(Path::new(remote)).map_err(io::Error::from)?;
        let mut dest = File::create(local)?;
        io::copy(&mut source, &mut dest)
    }
}

impl Drop for Ssh2FileTransfer {
    fn drop(&mut self) {
        tracing::debug!(host = %self.target, "SFTP channel released");
    }
}

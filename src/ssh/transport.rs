//! Seams between the engine and the secure-shell library.
//!
//! Every method here is blocking. Callers drive them from
//! `tokio::task::spawn_blocking`, never from an async task directly.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::config::ConnectConfig;
use crate::error::Result;
use crate::ssh::params::ConnectionParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// A piece of output read from a running remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            data: data.into(),
        }
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Opens authenticated sessions.
pub trait Transport: Send + Sync {
    fn connect(
        &self,
        params: &ConnectionParams,
        config: &ConnectConfig,
    ) -> Result<Arc<dyn RemoteSession>>;
}

/// An authenticated session to one host.
pub trait RemoteSession: Send + Sync {
    /// Start `command` on a fresh exec channel. `stdin`, when given, is
    /// written to the command's standard input, which is then closed.
    fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<Box<dyn RemoteChannel>>;

    /// Open a file-transfer sub-channel. Dropping the box releases it.
    fn open_sftp(&self) -> Result<Box<dyn FileTransfer>>;

    fn disconnect(&self);
}

/// A running remote command.
pub trait RemoteChannel: Send {
    /// Return whatever output is available right now without waiting for more.
    /// `Ok(None)` means nothing is buffered at the moment.
    fn read(&mut self) -> io::Result<Option<OutputChunk>>;

    /// The remote side has closed its output.
    fn is_eof(&mut self) -> bool;

    /// Ask the server to tear the channel down. Best effort: the remote
    /// process may keep running.
    fn close(&mut self);

    /// Exit status, once the command has finished.
    fn exit_status(&mut self) -> Option<i32>;
}

/// An open file-transfer sub-channel.
pub trait FileTransfer: Send {
    /// Create one directory level. Fails with `ErrorKind::AlreadyExists`
    /// when the directory is already there.
    fn mkdir(&mut self, path: &str) -> io::Result<()>;

    fn upload(&mut self, local: &Path, remote: &str) -> io::Result<u64>;

    fn download(&mut self, remote: &str, local: &Path) -> io::Result<u64>;
}

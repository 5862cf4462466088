use std::fmt;
use std::path::PathBuf;

/// Secret material used to authenticate a session.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Identity of a remote login, used to key pooled connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub host: String,
    pub username: String,
    pub port: u16,
}

/// Everything needed to open a session to one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

pub const DEFAULT_SSH_PORT: u16 = 22;

impl ConnectionParams {
    pub fn new(host: impl Into<String>, username: impl Into<String>, credential: Credential) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            credential,
        }
    }

    pub fn with_password(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, username, Credential::Password(password.into()))
    }

    pub fn with_key_file(
        host: impl Into<String>,
        username: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            host,
            username,
            Credential::KeyFile {
                path: path.into(),
                passphrase: None,
            },
        )
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Parse a login string like "user@host", "user@host:port" or, for
    /// IPv6 literals, "user@[::1]:port". An unbracketed host may not
    /// contain ':'.
    pub fn parse(s: &str, credential: Credential) -> Option<Self> {
        let (user, rest) = s.split_once('@')?;
        let (host, port) = match rest.strip_prefix('[') {
            Some(bracketed) => {
                let (host, after) = bracketed.split_once(']')?;
                let port = match after {
                    "" => DEFAULT_SSH_PORT,
                    _ => after.strip_prefix(':')?.parse().ok()?,
                };
                (host, port)
            }
            None => match rest.split_once(':') {
                Some((host, port)) => (host, port.parse().ok()?),
                None => (rest, DEFAULT_SSH_PORT),
            },
        };

        if user.is_empty() || host.is_empty() {
            return None;
        }
        Some(Self::new(host, user, credential).port(port))
    }

    /// Stable "user@host:port" label used in job records and logs. IPv6
    /// hosts are bracketed.
    pub fn target_id(&self) -> String {
        if self.host.contains(':') {
            format!("{}@[{}]:{}", self.username, self.host, self.port)
        } else {
            format!("{}@{}:{}", self.username, self.host, self.port)
        }
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            host: self.host.clone(),
            username: self.username.clone(),
            port: self.port,
        }
    }

    pub fn password(&self) -> Option<&str> {
        match &self.credential {
            Credential::Password(password) => Some(password),
            Credential::KeyFile { .. } => None,
        }
    }
}

use serde::{Deserialize, Serialize};

use crate::remote::executor::CommandExecutor;
use crate::ssh::connection::Connection;

/// Probe that prints a version banner on Windows hosts.
pub const WINDOWS_PROBE: &str = "ver";
/// Probe that prints the kernel name on Unix-like hosts.
pub const UNIX_PROBE: &str = "uname -a";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteOs {
    Windows,
    Linux,
    Unknown,
}

impl std::fmt::Display for RemoteOs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteOs::Windows => write!(f, "windows"),
            RemoteOs::Linux => write!(f, "linux"),
            RemoteOs::Unknown => write!(f, "unknown"),
        }
    }
}

/// Per-OS conventions for paths and helper commands.
#[derive(Debug, PartialEq, Eq)]
pub struct OsCapabilities {
    pub separator: char,
    /// Interpreter used for uploaded Python scripts.
    pub interpreter: &'static str,
    /// Prints the login's home directory.
    pub home_probe: &'static str,
    /// Parent of home directories, used when the probe prints nothing.
    pub home_root: &'static str,
    pub reboot: &'static str,
    windows_shell: bool,
}

static WINDOWS: OsCapabilities = OsCapabilities {
    separator: '\\',
    interpreter: "python",
    home_probe: "powershell -Command \"Write-Output $env:USERPROFILE\"",
    home_root: "C:\\Users",
    reboot: "shutdown /r /t 0",
    windows_shell: true,
};

static POSIX: OsCapabilities = OsCapabilities {
    separator: '/',
    interpreter: "python3",
    home_probe: "echo $HOME",
    home_root: "/home",
    reboot: "sudo -S -p '' reboot",
    windows_shell: false,
};

impl RemoteOs {
    /// Classify probe output by substring.
    pub fn classify(probe_output: &str) -> RemoteOs {
        if probe_output.contains("Microsoft") || probe_output.contains("Windows") {
            RemoteOs::Windows
        } else if probe_output.contains("Linux") {
            RemoteOs::Linux
        } else {
            RemoteOs::Unknown
        }
    }

    pub fn is_known(&self) -> bool {
        *self != RemoteOs::Unknown
    }

    /// Conventions for this OS. Unknown hosts get POSIX conventions.
    pub fn capabilities(&self) -> &'static OsCapabilities {
        match self {
            RemoteOs::Windows => &WINDOWS,
            RemoteOs::Linux | RemoteOs::Unknown => &POSIX,
        }
    }
}

impl OsCapabilities {
    /// Join a directory and a child name with this OS's separator.
    pub fn join(&self, dir: &str, name: &str) -> String {
        let trimmed = dir.trim_end_matches(['/', '\\']);
        if trimmed.is_empty() && !self.windows_shell {
            return format!("/{name}");
        }
        format!("{}{}{}", trimmed, self.separator, name)
    }

    pub fn home_fallback(&self, username: &str) -> String {
        self.join(self.home_root, username)
    }

    /// Quote a value for the remote shell.
    pub fn quote(&self, value: &str) -> String {
        if self.windows_shell {
            format!("'{}'", value.replace('\'', "''"))
        } else {
            format!("'{}'", value.replace('\'', r"'\''"))
        }
    }

    /// Create `path` and any missing parents. On Windows the command echoes
    /// the resulting path.
    pub fn mkdir_command(&self, path: &str) -> String {
        if self.windows_shell {
            let quoted = self.quote(path);
            format!(
                "powershell -Command \"New-Item -ItemType Directory -Path {quoted} -Force | Out-Null; Write-Output {quoted}\""
            )
        } else {
            format!("mkdir -p {}", self.quote(path))
        }
    }

    /// Wrap a PowerShell snippet for the given launcher binary.
    pub fn powershell_command(&self, launcher: &str, script: &str) -> String {
        format!("{} -Command \"{}\"", launcher, script.replace('"', "\\\""))
    }
}

/// Probe the remote OS. Probe failures are logged and skipped; when no
/// probe identifies the host the answer is `Unknown`.
pub async fn detect(executor: &CommandExecutor, conn: &Connection) -> RemoteOs {
    for probe in [WINDOWS_PROBE, UNIX_PROBE] {
        match executor.probe(conn, probe).await {
            Ok(output) => {
                let os = RemoteOs::classify(&output.stdout);
                if os.is_known() {
                    tracing::debug!(host = %conn.target_id(), probe, os = %os, "Detected remote OS");
                    return os;
                }
            }
            Err(e) => {
                tracing::debug!(host = %conn.target_id(), probe, error = %e, "OS probe failed");
            }
        }
    }

    tracing::warn!(host = %conn.target_id(), "Could not determine remote OS");
    RemoteOs::Unknown
}

/// The connection's OS, probing once and caching known answers.
pub async fn resolve(executor: &CommandExecutor, conn: &Connection) -> RemoteOs {
    if let Some(os) = conn.cached_os() {
        return os;
    }
    let os = detect(executor, conn).await;
    conn.cache_os(os);
    os
}

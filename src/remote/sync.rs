use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{Result, RunnerError};
use crate::remote::executor::CommandExecutor;
use crate::remote::os::{self, OsCapabilities, RemoteOs};
use crate::ssh::connection::Connection;
use crate::ssh::transport::FileTransfer;

const SCRATCH_SUFFIX_LEN: usize = 8;

/// Moves files and directory trees to and from a remote host over SFTP.
#[derive(Debug, Clone)]
pub struct FileSync {
    executor: CommandExecutor,
}

fn scratch_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SCRATCH_SUFFIX_LEN)
        .map(char::from)
        .collect()
}

/// Hidden scratch directory name, optionally labelled with the source basename.
pub fn scratch_dir_name(label: Option<&str>) -> String {
    match label {
        Some(label) => format!(".tmp_{}_{}", label, scratch_suffix()),
        None => format!(".tmp_{}", scratch_suffix()),
    }
}

impl FileSync {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    /// The login's home directory. Falls back to the conventional location
    /// when the probe prints nothing.
    pub async fn remote_home(&self, conn: &Connection) -> Result<String> {
        let os = os::resolve(&self.executor, conn).await;
        if !os.is_known() {
            return Err(RunnerError::Transfer(format!(
                "cannot determine home directory on {}: unknown operating system",
                conn.target_id()
            )));
        }
        let caps = os.capabilities();
        let output = self.executor.probe(conn, caps.home_probe).await?;
        Ok(match output.first_line() {
            Some(home) => home.to_string(),
            None => caps.home_fallback(&conn.params().username),
        })
    }

    /// Create `path` (and parents) on the host. Returns the path the remote
    /// side reported, or `path` itself.
    async fn prepare_dir(
        &self,
        conn: &Connection,
        caps: &OsCapabilities,
        path: &str,
    ) -> Result<String> {
        let output = self.executor.probe(conn, &caps.mkdir_command(path)).await?;
        if !output.succeeded() {
            tracing::warn!(
                host = %conn.target_id(),
                path,
                stderr = %output.stderr.trim(),
                "Remote mkdir reported a problem"
            );
        }
        Ok(match output.first_line() {
            Some(reported) if caps.separator == '\\' => reported.to_string(),
            _ => path.to_string(),
        })
    }

    async fn scratch_dir(
        &self,
        conn: &Connection,
        caps: &OsCapabilities,
        label: Option<&str>,
    ) -> Result<String> {
        let home = self.remote_home(conn).await?;
        let path = caps.join(&home, &scratch_dir_name(label));
        self.prepare_dir(conn, caps, &path).await
    }

    async fn resolve_caps(&self, conn: &Connection) -> (RemoteOs, &'static OsCapabilities) {
        let os = os::resolve(&self.executor, conn).await;
        (os, os.capabilities())
    }

    /// Upload one file into `remote_dir`, or into a fresh scratch directory
    /// under the remote home. Returns the full remote path.
    pub async fn send_file(
        &self,
        conn: &Connection,
        local: &Path,
        remote_dir: Option<&str>,
    ) -> Result<String> {
        let not_found = || RunnerError::LocalNotFound(local.display().to_string());
        let meta = tokio::fs::metadata(local).await.map_err(|_| not_found())?;
        if !meta.is_file() {
            return Err(not_found());
        }
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(not_found)?
            .to_string();

        let (_, caps) = self.resolve_caps(conn).await;
        let dest_dir = match remote_dir {
            Some(dir) => self.prepare_dir(conn, caps, dir).await?,
            None => self.scratch_dir(conn, caps, None).await?,
        };
        let remote_path = caps.join(&dest_dir, &file_name);

        let mut sftp = open_sftp(conn).await?;
        let source = local.to_path_buf();
        let dest = remote_path.clone();
        let bytes = tokio::task::spawn_blocking(move || -> Result<u64> {
            sftp.upload(&source, &dest).map_err(|e| {
                RunnerError::Transfer(format!("upload {} -> {}: {e}", source.display(), dest))
            })
        })
        .await
        .map_err(|e| RunnerError::Transfer(format!("upload task failed: {e}")))??;

        tracing::info!(
            host = %conn.target_id(),
            local = %local.display(),
            remote = %remote_path,
            bytes,
            "File uploaded"
        );
        Ok(remote_path)
    }

    /// Upload a directory tree, empty directories included. Returns the
    /// remote root.
    pub async fn send_directory(
        &self,
        conn: &Connection,
        local_dir: &Path,
        remote_dir: Option<&str>,
    ) -> Result<String> {
        let meta = tokio::fs::metadata(local_dir).await.map_err(|e| {
            RunnerError::Transfer(format!("local directory {}: {e}", local_dir.display()))
        })?;
        if !meta.is_dir() {
            return Err(RunnerError::Transfer(format!(
                "{} is not a directory",
                local_dir.display()
            )));
        }
        let base = local_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("dir")
            .to_string();

        let (_, caps) = self.resolve_caps(conn).await;
        let root = match remote_dir {
            Some(dir) => self.prepare_dir(conn, caps, dir).await?,
            None => self.scratch_dir(conn, caps, Some(&base)).await?,
        };

        let mut sftp = open_sftp(conn).await?;
        let source = local_dir.to_path_buf();
        let dest = root.clone();
        let files = tokio::task::spawn_blocking(move || -> Result<usize> {
            upload_tree(sftp.as_mut(), caps, &source, &dest)
        })
        .await
        .map_err(|e| RunnerError::Transfer(format!("upload task failed: {e}")))??;

        tracing::info!(
            host = %conn.target_id(),
            local = %local_dir.display(),
            remote = %root,
            files,
            "Directory uploaded"
        );
        Ok(root)
    }

    /// Download one remote file to `local`.
    pub async fn receive_file(
        &self,
        conn: &Connection,
        remote_path: &str,
        local: &Path,
    ) -> Result<u64> {
        let mut sftp = open_sftp(conn).await?;
        let source = remote_path.to_string();
        let dest: PathBuf = local.to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || -> Result<u64> {
            sftp.download(&source, &dest).map_err(|e| {
                RunnerError::Transfer(format!("download {} -> {}: {e}", source, dest.display()))
            })
        })
        .await
        .map_err(|e| RunnerError::Transfer(format!("download task failed: {e}")))??;

        tracing::info!(
            host = %conn.target_id(),
            remote = remote_path,
            local = %local.display(),
            bytes,
            "File downloaded"
        );
        Ok(bytes)
    }
}

/// Open an SFTP sub-channel. A session that cannot open one is marked broken.
async fn open_sftp(conn: &Connection) -> Result<Box<dyn FileTransfer>> {
    let session = conn.session()?;
    let opened = tokio::task::spawn_blocking(move || session.open_sftp())
        .await
        .map_err(|e| RunnerError::Transfer(format!("SFTP task failed: {e}")))?;
    if opened.is_err() {
        conn.mark_broken();
    }
    opened
}

fn ensure_dir(sftp: &mut dyn FileTransfer, path: &str) -> Result<()> {
    match sftp.mkdir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(RunnerError::Transfer(format!("mkdir {path}: {e}"))),
    }
}

/// Mirror `local` under `remote`. Returns the number of files uploaded.
fn upload_tree(
    sftp: &mut dyn FileTransfer,
    caps: &OsCapabilities,
    local: &Path,
    remote: &str,
) -> Result<usize> {
    ensure_dir(sftp, remote)?;

    let read_dir = |dir: &Path| {
        std::fs::read_dir(dir)
            .and_then(|entries| entries.collect::<std::io::Result<Vec<_>>>())
            .map_err(|e| RunnerError::Transfer(format!("read {}: {e}", dir.display())))
    };
    let mut entries = read_dir(local)?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut uploaded = 0;
    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let remote_path = caps.join(remote, &name);
        let file_type = entry
            .file_type()
            .map_err(|e| RunnerError::Transfer(format!("stat {}: {e}", path.display())))?;

        // Links are never descended into, so a cycle cannot recurse.
        // A link to a regular file is uploaded as that file's contents.
        if file_type.is_symlink() && !std::fs::metadata(&path).is_ok_and(|m| m.is_file()) {
            tracing::warn!(
                path = %path.display(),
                "Skipping symlink that does not point to a regular file"
            );
            continue;
        }

        if file_type.is_dir() {
            uploaded += upload_tree(sftp, caps, &path, &remote_path)?;
        } else {
            sftp.upload(&path, &remote_path).map_err(|e| {
                RunnerError::Transfer(format!("upload {} -> {}: {e}", path.display(), remote_path))
            })?;
            uploaded += 1;
        }
    }
    Ok(uploaded)
}

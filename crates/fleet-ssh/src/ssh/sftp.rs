//! File transfer over the SFTP subsystem.

use std::path::{Path, PathBuf};

use russh::client;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use super::handler::ClientHandler;
use crate::error::{Result, SshError};
use crate::remote::PutOptions;
use crate::result::RemoteFile;

/// Permission bits compared and applied on upload.
const MODE_MASK: u32 = 0o7777;

/// Mode given to files whose local permissions cannot be read.
#[cfg(not(unix))]
const FALLBACK_MODE: u32 = 0o644;

/// Open an SFTP session on a fresh channel.
pub async fn open(handle: &client::Handle<ClientHandler>) -> Result<SftpSession> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| SshError::protocol(format!("failed to open SFTP channel: {e}")))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| SshError::protocol(format!("failed to request SFTP subsystem: {e}")))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| SshError::protocol(format!("failed to initialize SFTP session: {e}")))
}

/// Map an SFTP error on `path`; "no such file" becomes [`SshError::NotFound`].
pub fn map_error(path: &str, err: SftpError) -> SshError {
    if is_missing(&err) {
        SshError::NotFound {
            path: path.to_string(),
        }
    } else {
        SshError::sftp(path, err)
    }
}

fn is_missing(err: &SftpError) -> bool {
    matches!(err, SftpError::Status(status) if status.status_code == StatusCode::NoSuchFile)
}

/// Whether `path` exists. Only "no such file" counts as absent.
pub async fn exists(sftp: &SftpSession, path: &str) -> Result<bool> {
    match sftp.symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if is_missing(&e) => Ok(false),
        Err(e) => Err(SshError::sftp(path, e)),
    }
}

/// Create `path` and every missing parent.
pub async fn create_dir_all(sftp: &SftpSession, path: &str) -> Result<()> {
    for dir in ancestors(path) {
        if !exists(sftp, &dir).await? {
            tracing::debug!(path = %dir, "Creating remote directory");
            sftp.create_dir(dir.as_str())
                .await
                .map_err(|e| map_error(&dir, e))?;
        }
    }
    Ok(())
}

/// Prefixes of a remote path, shortest first: `/a/b` gives `/a`, `/a/b`.
fn ancestors(path: &str) -> Vec<String> {
    let absolute = path.starts_with('/');
    let mut current = String::new();
    let mut out = Vec::new();
    for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(part);
        out.push(current.clone());
    }
    out
}

/// Upload one file, then fix its permissions if they differ.
pub async fn upload_file(
    sftp: &SftpSession,
    local: &Path,
    remote: &str,
    options: PutOptions,
) -> Result<RemoteFile> {
    let local_meta = tokio::fs::metadata(local)
        .await
        .map_err(|e| SshError::local_io(local, e))?;
    let mut source = tokio::fs::File::open(local)
        .await
        .map_err(|e| SshError::local_io(local, e))?;

    tracing::debug!(local = %local.display(), remote = %remote, "Uploading file");
    let mut target = sftp.create(remote).await.map_err(|e| map_error(remote, e))?;
    tokio::io::copy(&mut source, &mut target)
        .await
        .map_err(|e| SshError::sftp(remote, e))?;
    target
        .shutdown()
        .await
        .map_err(|e| SshError::sftp(remote, e))?;

    let attrs = sftp.metadata(remote).await.map_err(|e| map_error(remote, e))?;
    let desired = desired_mode(options, local_mode(&local_meta));
    let mut mode = attrs.permissions.map(|m| m & MODE_MASK);
    if needs_chmod(desired, mode) {
        tracing::debug!(remote = %remote, mode = %format!("{desired:o}"), "Changing remote mode");
        let update = FileAttributes {
            permissions: Some(desired),
            ..FileAttributes::empty()
        };
        sftp.set_metadata(remote, update)
            .await
            .map_err(|e| map_error(remote, e))?;
        mode = Some(desired);
    }

    Ok(RemoteFile {
        path: remote.to_string(),
        size: attrs.size.unwrap_or(local_meta.len()),
        mode: mode.unwrap_or(desired),
    })
}

/// Upload a local tree below `remote`, mirroring `scp -r`: the tree lands
/// in `remote/<basename of local>`.
pub async fn upload_tree(
    sftp: &SftpSession,
    local: &Path,
    remote: &str,
    options: PutOptions,
) -> Result<Vec<RemoteFile>> {
    let plan = TreePlan::build(local, remote)?;

    create_dir_all(sftp, remote).await?;
    for dir in &plan.dirs {
        if !exists(sftp, dir).await? {
            tracing::debug!(path = %dir, "Creating remote directory");
            sftp.create_dir(dir.as_str())
                .await
                .map_err(|e| map_error(dir, e))?;
        }
    }

    let mut uploaded = Vec::with_capacity(plan.files.len());
    for (local_file, remote_file) in &plan.files {
        uploaded.push(upload_file(sftp, local_file, remote_file, options).await?);
    }
    Ok(uploaded)
}

/// Mode a file should end up with: the explicit mode, unless mirroring was
/// asked for or no mode was given.
pub fn desired_mode(options: PutOptions, local_mode: u32) -> u32 {
    match options.mode {
        Some(mode) if !options.mirror_local_mode => mode & MODE_MASK,
        _ => local_mode & MODE_MASK,
    }
}

/// Whether a remote file with `remote_mode` needs a chmod to `desired`.
pub fn needs_chmod(desired: u32, remote_mode: Option<u32>) -> bool {
    remote_mode.map(|m| m & MODE_MASK) != Some(desired & MODE_MASK)
}

#[cfg(unix)]
fn local_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn local_mode(_meta: &std::fs::Metadata) -> u32 {
    FALLBACK_MODE
}

/// Remote directories and files of a tree upload, parents first.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TreePlan {
    /// Directories to create, each after its parent.
    pub dirs: Vec<String>,
    /// Local file and its remote destination.
    pub files: Vec<(PathBuf, String)>,
}

impl TreePlan {
    /// Walk `local` and map every entry below `remote`.
    pub fn build(local: &Path, remote: &str) -> Result<Self> {
        let base = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let root = remote_join(remote, &base);

        let mut plan = Self::default();
        for entry in WalkDir::new(local).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map_or_else(|| local.to_path_buf(), Path::to_path_buf);
                SshError::local_io(path, e.into())
            })?;
            let relative = entry
                .path()
                .strip_prefix(local)
                .unwrap_or(entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let target = if relative.is_empty() {
                root.clone()
            } else {
                remote_join(&root, &relative)
            };

            if entry.file_type().is_dir() {
                plan.dirs.push(target);
            } else if entry.path().is_file() {
                plan.files.push((entry.into_path(), target));
            }
        }
        Ok(plan)
    }
}

/// Join remote path segments with `/`.
fn remote_join(base: &str, name: &str) -> String {
    if base.is_empty() {
        return name.to_string();
    }
    if name.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), name)
}

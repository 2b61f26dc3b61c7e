//! The seam between the fleet coordinator and a host session.
//!
//! [`FleetCoordinator`](crate::fleet::FleetCoordinator) only talks to hosts
//! through these traits. [`SshConnector`](crate::ssh::SshConnector) is the
//! production implementation; anything else that can run commands and move
//! files (an in-memory fake, a recorded transcript) can stand in for it.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::host::HostAddr;
use crate::result::{CommandResult, DirRemoval, RemoteFile};

/// Options for file uploads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Permission bits to apply to uploaded files; the local file's bits
    /// when unset.
    pub mode: Option<u32>,
    /// Copy each local file's permission bits, overriding `mode`.
    pub mirror_local_mode: bool,
}

impl PutOptions {
    /// Upload with explicit permission bits.
    #[must_use]
    pub const fn with_mode(mode: u32) -> Self {
        Self {
            mode: Some(mode),
            mirror_local_mode: false,
        }
    }

    /// Upload mirroring local permission bits.
    #[must_use]
    pub const fn mirrored() -> Self {
        Self {
            mode: None,
            mirror_local_mode: true,
        }
    }
}

/// An established session to one host.
pub trait RemoteSession: Send + 'static {
    /// Run `command`, optionally shell-quoting it first.
    ///
    /// With a `timeout`, a command still running when it elapses fails with
    /// [`SshError::CommandTimeout`](crate::error::SshError::CommandTimeout)
    /// carrying the output captured so far.
    fn run(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
        quote: bool,
    ) -> impl Future<Output = Result<CommandResult>> + Send;

    /// Upload one file.
    fn put(
        &mut self,
        local: &Path,
        remote: &str,
        options: PutOptions,
    ) -> impl Future<Output = Result<RemoteFile>> + Send;

    /// Upload a directory tree below `remote`, creating directories first.
    fn put_dir(
        &mut self,
        local: &Path,
        remote: &str,
        options: PutOptions,
    ) -> impl Future<Output = Result<Vec<RemoteFile>>> + Send;

    /// Create a remote directory.
    fn mkdir(&mut self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Delete a remote file.
    fn delete_file(&mut self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Delete a remote directory; `force` removes it with its contents.
    fn delete_dir(
        &mut self,
        path: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<DirRemoval>> + Send;

    /// Whether a remote path exists.
    fn exists(&mut self, path: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Tear the session down. Must succeed on a partly established session
    /// and when called more than once.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Opens sessions to hosts.
pub trait Connector: Send + Sync + 'static {
    /// Session type produced.
    type Session: RemoteSession;

    /// Connect and authenticate to `host`.
    fn connect(&self, host: &HostAddr) -> impl Future<Output = Result<Self::Session>> + Send;
}

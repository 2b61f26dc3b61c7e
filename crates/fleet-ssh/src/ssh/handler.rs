//! russh client handler: host key verification against `known_hosts`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use russh::client;
use russh::keys::{HashAlg, PublicKey};

use crate::auth::HostKeyVerification;
use crate::config::env::home_dir;

/// What `known_hosts` says about a host's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHostStatus {
    /// An entry for the host carries this key.
    Match,
    /// The host is listed with a different key.
    Mismatch,
    /// The host is not listed.
    Unknown,
}

/// Client handler for one connection.
#[derive(Debug)]
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyVerification,
    known_hosts: PathBuf,
    /// Set when the server key was refused, so the caller can tell a host
    /// key failure apart from other handshake errors.
    rejected: Arc<AtomicBool>,
}

impl ClientHandler {
    /// Create a handler for `host:port`. Returns the handler and a flag that
    /// is raised if the host key gets rejected.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        policy: HostKeyVerification,
    ) -> (Self, Arc<AtomicBool>) {
        let rejected = Arc::new(AtomicBool::new(false));
        let handler = Self {
            host: host.into(),
            port,
            policy,
            known_hosts: known_hosts_path(),
            rejected: Arc::clone(&rejected),
        };
        (handler, rejected)
    }

    /// Use a specific `known_hosts` file.
    #[must_use]
    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = path.into();
        self
    }

    /// Apply the policy to a presented key.
    pub fn verify(&self, key: &PublicKey) -> bool {
        let status = lookup_known_host(&self.known_hosts, &self.host, self.port, key);
        let accepted = match (status, self.policy) {
            (KnownHostStatus::Match, _) => {
                tracing::debug!(host = %self.host, "Host key verified against known_hosts");
                true
            }
            (KnownHostStatus::Mismatch, _) => {
                tracing::error!(
                    host = %self.host,
                    fingerprint = %key.fingerprint(HashAlg::Sha256),
                    "HOST KEY MISMATCH! Possible man-in-the-middle attack!"
                );
                false
            }
            (KnownHostStatus::Unknown, HostKeyVerification::KnownHosts) => {
                tracing::warn!(host = %self.host, "Host not found in known_hosts, rejecting key");
                false
            }
            (KnownHostStatus::Unknown, HostKeyVerification::AcceptNew) => {
                tracing::info!(
                    host = %self.host,
                    fingerprint = %key.fingerprint(HashAlg::Sha256),
                    "Accepting key of unknown host"
                );
                true
            }
            (KnownHostStatus::Unknown, HostKeyVerification::Tofu) => {
                remember_host(&self.known_hosts, &self.host, self.port, key);
                true
            }
        };
        if !accepted {
            self.rejected.store(true, Ordering::SeqCst);
        }
        accepted
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(self.verify(server_public_key))
    }
}

/// `known_hosts` name of a host: bare for port 22, `[host]:port` otherwise.
fn host_entry(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

/// Look `host` up in a `known_hosts` file.
///
/// Hashed entries and marker lines (`@cert-authority`, `@revoked`) are not
/// interpreted.
#[must_use]
pub fn lookup_known_host(path: &Path, host: &str, port: u16, key: &PublicKey) -> KnownHostStatus {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return KnownHostStatus::Unknown;
    };
    let entry = host_entry(host, port);
    let presented = key.fingerprint(HashAlg::Sha256);
    let mut listed = false;

    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(names), Some(_key_type), Some(data)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !names.split(',').any(|n| n == entry) {
            continue;
        }
        listed = true;
        match russh::keys::parse_public_key_base64(data) {
            Ok(stored) if stored.fingerprint(HashAlg::Sha256) == presented => {
                return KnownHostStatus::Match;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(host = %host, error = %e, "Unparseable known_hosts key"),
        }
    }

    if listed {
        KnownHostStatus::Mismatch
    } else {
        KnownHostStatus::Unknown
    }
}

/// Append a host key to `known_hosts`. Failures are logged; the key is
/// still accepted for this connection.
fn remember_host(path: &Path, host: &str, port: u16, key: &PublicKey) {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(error = %e, "Failed to create known_hosts directory");
                return;
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
            }
        }
    }

    let Ok(openssh) = key.to_openssh() else {
        tracing::warn!(host = %host, "Could not encode host key, not saving it");
        return;
    };
    // Drop the comment: "<type> <base64>"
    let encoded: Vec<&str> = openssh.split_whitespace().take(2).collect();
    let line = format!("{} {}\n", host_entry(host, port), encoded.join(" "));

    let written = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(line.as_bytes()));
    match written {
        Ok(()) => tracing::info!(
            host = %host,
            path = %path.display(),
            "Added host key to known_hosts"
        ),
        Err(e) => tracing::warn!(error = %e, "Failed to write known_hosts"),
    }
}

/// Default `known_hosts` location; `SSH_KNOWN_HOSTS` overrides it.
#[must_use]
pub fn known_hosts_path() -> PathBuf {
    if let Ok(path) = std::env::var("SSH_KNOWN_HOSTS") {
        return PathBuf::from(path);
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("known_hosts")
}

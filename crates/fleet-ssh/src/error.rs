//! Error types for fleet-ssh.
//!
//! Two layers of errors exist. [`SshError`] describes what went wrong on a
//! single host and is what every [`SshSession`](crate::ssh::SshSession)
//! operation returns. [`FleetError`] describes failures of a whole
//! fleet-level call, such as an empty host list or no reachable hosts.
//!
//! Per-host errors normally never escape a fleet call: they are folded into
//! an [`ErrorResult`](crate::result::ErrorResult) entry for that host.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Problems with private key data, detected before any network activity.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The key file is passphrase protected and no passphrase was given.
    #[error("private key {source_name} is passphrase protected but no passphrase was provided")]
    PassphraseRequired {
        /// Path of the key file, or `key material`.
        source_name: String,
    },

    /// A passphrase was given but does not decrypt the key.
    #[error("Invalid passphrase or invalid/unsupported key type")]
    WrongPassphrase,

    /// The data is a private key, but of a type we cannot use.
    #[error("Invalid or unsupported key type ({kind})")]
    UnsupportedType {
        /// Key type as reported by the decoder.
        kind: String,
    },

    /// The data is not a decodable private key at all.
    #[error("private key data is corrupt or not a private key: {reason}")]
    Corrupt {
        /// Decoder message.
        reason: String,
    },

    /// Key material was expected but something resembling a path was given.
    #[error(
        "\"private_key\" parameter needs to contain private key data / content and not a path"
    )]
    LooksLikePath,

    /// A key file could not be read.
    #[error("failed to read private key file {}", path.display())]
    Read {
        /// The key file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced by a single host session.
#[derive(Debug, Error)]
pub enum SshError {
    /// TCP connect or SSH handshake failed.
    #[error("failed to connect to {host}:{port}: {reason}")]
    Connection {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// Failure reason.
        reason: String,
    },

    /// The connect phase did not finish in time.
    #[error("connection to {host}:{port} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// The configured connect timeout.
        timeout: Duration,
    },

    /// Every configured authentication method was rejected.
    #[error("authentication failed for user {user}: {reason}")]
    Authentication {
        /// Username.
        user: String,
        /// Failure reason.
        reason: String,
    },

    /// Private key could not be used.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The server's host key was rejected.
    #[error("host key verification failed for {host}")]
    HostKey {
        /// Target host.
        host: String,
    },

    /// Connecting through the bastion host failed.
    #[error("bastion host {bastion} could not relay the connection")]
    Bastion {
        /// Bastion host as configured.
        bastion: String,
        /// What went wrong on the bastion leg.
        #[source]
        source: Box<SshError>,
    },

    /// A command ran past its timeout. Carries the output captured so far.
    #[error(
        "Command didn't finish in {} seconds or the SSH connection did not succeed in {} seconds",
        .timeout.as_secs(),
        .connect_timeout.as_secs()
    )]
    CommandTimeout {
        /// The command, with secrets masked.
        command: String,
        /// The command timeout.
        timeout: Duration,
        /// The connect timeout the session was opened with.
        connect_timeout: Duration,
        /// Stdout captured before the timeout.
        stdout: String,
        /// Stderr captured before the timeout.
        stderr: String,
    },

    /// Channel or protocol level failure after connecting.
    #[error("SSH protocol error: {reason}")]
    Protocol {
        /// Failure reason.
        reason: String,
    },

    /// An SFTP operation failed.
    #[error("SFTP operation on {path} failed: {reason}")]
    Sftp {
        /// Remote path involved.
        path: String,
        /// Failure reason.
        reason: String,
    },

    /// A remote path does not exist.
    #[error("remote path {path} does not exist")]
    NotFound {
        /// Remote path.
        path: String,
    },

    /// The sudo password was wrong or sudo is not configured for the user.
    #[error("Invalid sudo password provided or sudo is not configured for this user ({user})")]
    SudoPassword {
        /// User sudo asked the password for.
        user: String,
    },

    /// Reading a local file or directory failed.
    #[error("local I/O error on {}", path.display())]
    LocalIo {
        /// Local path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An operation was attempted on a session that is not connected.
    #[error("Host is not connected.")]
    NotConnected,
}

impl SshError {
    /// Create a connection error.
    pub fn connection(host: impl Into<String>, port: u16, reason: impl ToString) -> Self {
        Self::Connection {
            host: host.into(),
            port,
            reason: reason.to_string(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(reason: impl ToString) -> Self {
        Self::Protocol {
            reason: reason.to_string(),
        }
    }

    /// Create an SFTP error.
    pub fn sftp(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::Sftp {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a local I/O error.
    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Check if this is a command timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::CommandTimeout { .. })
    }

    /// Check if this error happened while establishing the session.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectTimeout { .. }
                | Self::Authentication { .. }
                | Self::Key(_)
                | Self::HostKey { .. }
                | Self::Bastion { .. }
        )
    }

    /// Output captured before the failure, if any.
    #[must_use]
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            Self::CommandTimeout { stdout, stderr, .. } => Some((stdout.as_str(), stderr.as_str())),
            _ => None,
        }
    }
}

/// Errors of a fleet-level call.
#[derive(Debug, Error)]
pub enum FleetError {
    /// No hosts were supplied.
    #[error("host list must not be empty")]
    EmptyHostList,

    /// A host string could not be parsed.
    #[error("invalid host {host:?}: {reason}")]
    InvalidHost {
        /// The host string as supplied.
        host: String,
        /// Why it is invalid.
        reason: String,
    },

    /// Inconsistent construction options or an unreadable settings file.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// The local path given to `put` does not exist.
    #[error("Local path {} does not exist", path.display())]
    LocalPathMissing {
        /// Local path.
        path: PathBuf,
    },

    /// A host failed to connect while `raise_on_any_error` was set.
    #[error("Failed connecting to host {host}.")]
    HostConnect {
        /// Host that failed.
        host: String,
        /// The per-host error.
        #[source]
        source: SshError,
    },

    /// Not a single host could be connected.
    #[error(
        "Unable to connect to any one of the hosts: {}.\n\n connect_errors={details}",
        .hosts.join(", ")
    )]
    NoHostsReachable {
        /// Every host that was attempted.
        hosts: Vec<String>,
        /// Pretty-printed JSON of every host's connect error.
        details: String,
    },
}

impl FleetError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type for per-host operations.
pub type Result<T> = std::result::Result<T, SshError>;

/// Result type for fleet-level operations.
pub type FleetResult<T> = std::result::Result<T, FleetError>;

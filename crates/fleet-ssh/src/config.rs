//! Configuration types.
//!
//! [`FleetSettings`] holds the operator-level knobs (concurrency cap,
//! connect timeout, host key policy, OpenSSH client config lookup). It is
//! read from a TOML file and then overridden from `FLEET_SSH_*` environment
//! variables. [`SessionConfig`] is the per-host configuration an
//! [`SshSession`](crate::ssh::SshSession) is built from.

pub mod env;
pub mod file;
pub mod ssh_config;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{Credentials, HostKeyVerification};
use crate::error::FleetResult;
use crate::host::HostAddr;
use crate::output::LineHandler;

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Default bound on TCP connect plus SSH handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default cap on concurrent per-host tasks.
pub const DEFAULT_MAX_PARALLEL_ACTIONS: usize = 50;

/// Sleep between polls of a running command's channel.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bound on a graceful disconnect.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How much shorter than the command timeout the connect timeout must be.
pub const CONNECT_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

/// Operator-level settings shared by every fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    /// Upper bound on concurrent per-host tasks.
    pub max_parallel_actions: usize,
    /// Connect timeout, in seconds.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Consult the OpenSSH client config for user, port and identity file.
    pub use_ssh_config: bool,
    /// OpenSSH client config location; `~/.ssh/config` when unset.
    pub ssh_config_file_path: Option<PathBuf>,
    /// Host key policy.
    pub host_key_verification: HostKeyVerification,
    /// Port used for hosts given without one.
    pub default_port: u16,
    /// Whether one successful host makes a fleet call succeed.
    pub allow_partial_failure: bool,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            max_parallel_actions: DEFAULT_MAX_PARALLEL_ACTIONS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            use_ssh_config: false,
            ssh_config_file_path: None,
            host_key_verification: HostKeyVerification::default(),
            default_port: DEFAULT_PORT,
            allow_partial_failure: false,
        }
    }
}

impl FleetSettings {
    /// Load settings from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> FleetResult<Self> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(settings.with_env(&env::EnvConfig::default()))
    }

    /// Resolved OpenSSH client config path.
    #[must_use]
    pub fn ssh_config_path(&self) -> PathBuf {
        self.ssh_config_file_path
            .clone()
            .map(|p| crate::auth::expand_tilde(&p))
            .or_else(|| env::home_dir().map(|h| h.join(".ssh").join("config")))
            .unwrap_or_else(|| PathBuf::from(".ssh/config"))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Configuration of one host session.
#[derive(Clone)]
pub struct SessionConfig {
    /// Target host.
    pub host: HostAddr,
    /// Login user. Empty means the OpenSSH config `User` when the config is
    /// consulted, then `$USER`.
    pub username: String,
    /// Credentials.
    pub credentials: Credentials,
    /// Optional bastion the connection is relayed through.
    pub bastion: Option<HostAddr>,
    /// Bound on TCP connect plus SSH handshake.
    pub connect_timeout: Duration,
    /// Host key policy.
    pub host_key_verification: HostKeyVerification,
    /// OpenSSH client config to consult, if any.
    pub ssh_config_path: Option<PathBuf>,
    /// Per-line stdout callback.
    pub stdout_handler: Option<LineHandler>,
    /// Per-line stderr callback.
    pub stderr_handler: Option<LineHandler>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("credentials", &self.credentials)
            .field("bastion", &self.bastion)
            .field("connect_timeout", &self.connect_timeout)
            .field("host_key_verification", &self.host_key_verification)
            .field("ssh_config_path", &self.ssh_config_path)
            .finish()
    }
}

impl SessionConfig {
    /// Create a config for `host` with default settings.
    #[must_use]
    pub fn new(host: HostAddr, username: impl Into<String>) -> Self {
        Self {
            host,
            username: username.into(),
            credentials: Credentials::Default,
            bastion: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            host_key_verification: HostKeyVerification::default(),
            ssh_config_path: None,
            stdout_handler: None,
            stderr_handler: None,
        }
    }

    /// Set credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Relay through a bastion host.
    #[must_use]
    pub fn bastion(mut self, bastion: HostAddr) -> Self {
        self.bastion = Some(bastion);
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Keep the connect timeout at least [`CONNECT_TIMEOUT_MARGIN`] below
    /// the timeout commands will run with.
    #[must_use]
    pub fn clamp_to_command_timeout(mut self, command_timeout: Option<Duration>) -> Self {
        if let Some(limit) = command_timeout {
            let ceiling = limit
                .saturating_sub(CONNECT_TIMEOUT_MARGIN)
                .max(Duration::from_secs(1));
            if self.connect_timeout > ceiling {
                self.connect_timeout = ceiling;
            }
        }
        self
    }

    /// Set the host key policy.
    #[must_use]
    pub const fn host_key_verification(mut self, policy: HostKeyVerification) -> Self {
        self.host_key_verification = policy;
        self
    }

    /// Consult an OpenSSH client config file.
    #[must_use]
    pub fn ssh_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_config_path = Some(path.into());
        self
    }

    /// Stream stdout lines to `handler`.
    #[must_use]
    pub fn stdout_handler(mut self, handler: LineHandler) -> Self {
        self.stdout_handler = Some(handler);
        self
    }

    /// Stream stderr lines to `handler`.
    #[must_use]
    pub fn stderr_handler(mut self, handler: LineHandler) -> Self {
        self.stderr_handler = Some(handler);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostAddr {
        HostAddr::parse("web1", DEFAULT_PORT).unwrap()
    }

    #[test]
    fn settings_defaults() {
        let s = FleetSettings::default();
        assert_eq!(s.max_parallel_actions, 50);
        assert_eq!(s.connect_timeout, Duration::from_secs(60));
        assert_eq!(s.default_port, 22);
        assert!(!s.use_ssh_config);
        assert!(!s.allow_partial_failure);
    }

    #[test]
    fn connect_timeout_is_clamped_below_command_timeout() {
        let cfg = SessionConfig::new(host(), "u").clamp_to_command_timeout(Some(Duration::from_secs(10)));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(8));

        let cfg = SessionConfig::new(host(), "u").clamp_to_command_timeout(Some(Duration::from_secs(600)));
        assert_eq!(cfg.connect_timeout, DEFAULT_CONNECT_TIMEOUT);

        let cfg = SessionConfig::new(host(), "u").clamp_to_command_timeout(Some(Duration::from_secs(1)));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(1));

        let cfg = SessionConfig::new(host(), "u").clamp_to_command_timeout(None);
        assert_eq!(cfg.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn session_debug_hides_password() {
        let cfg = SessionConfig::new(host(), "u").credentials(Credentials::password("s3cret"));
        assert!(!format!("{cfg:?}").contains("s3cret"));
    }

    #[test]
    fn explicit_ssh_config_path_wins() {
        let s = FleetSettings {
            ssh_config_file_path: Some(PathBuf::from("/etc/fleet/ssh_config")),
            ..FleetSettings::default()
        };
        assert_eq!(s.ssh_config_path(), PathBuf::from("/etc/fleet/ssh_config"));
    }
}

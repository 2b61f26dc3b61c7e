//! Environment-based configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::FleetSettings;

/// Environment configuration prefix.
pub const DEFAULT_PREFIX: &str = "FLEET_SSH";

/// Environment variable reader.
///
/// Reads the process environment, or a fixed map when built with
/// [`EnvConfig::from_map`].
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Prefix for environment variables.
    prefix: String,
    /// Values used instead of the process environment.
    fixed: Option<HashMap<String, String>>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl EnvConfig {
    /// Create a reader for the process environment.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            fixed: None,
        }
    }

    /// Create a reader over a fixed set of variables.
    #[must_use]
    pub fn from_map<I, K, V>(prefix: impl Into<String>, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            prefix: prefix.into(),
            fixed: Some(
                vars.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Build the full environment variable name.
    fn var_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_uppercase()
        } else {
            format!("{}_{}", self.prefix, name.to_uppercase())
        }
    }

    /// Get a string value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        let var_name = self.var_name(name);
        match &self.fixed {
            Some(vars) => vars.get(&var_name).cloned(),
            None => std::env::var(&var_name).ok(),
        }
    }

    /// Get a parsed value.
    #[must_use]
    pub fn parse<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    /// Get a boolean value.
    #[must_use]
    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).map(|v| {
            matches!(
                v.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on" | "enabled"
            )
        })
    }

    /// Get a duration in seconds.
    #[must_use]
    pub fn duration_secs(&self, name: &str) -> Option<Duration> {
        self.parse::<u64>(name).map(Duration::from_secs)
    }
}

/// Variable names, without the prefix.
pub mod vars {
    /// Concurrency cap.
    pub const MAX_PARALLEL_ACTIONS: &str = "MAX_PARALLEL_ACTIONS";
    /// Connect timeout in seconds.
    pub const CONNECT_TIMEOUT: &str = "CONNECT_TIMEOUT";
    /// Consult the OpenSSH client config.
    pub const USE_SSH_CONFIG: &str = "USE_SSH_CONFIG";
    /// OpenSSH client config path.
    pub const SSH_CONFIG_FILE_PATH: &str = "SSH_CONFIG_FILE_PATH";
    /// Host key policy.
    pub const HOST_KEY_VERIFICATION: &str = "HOST_KEY_VERIFICATION";
    /// Default port.
    pub const DEFAULT_PORT: &str = "DEFAULT_PORT";
    /// Partial failure tolerance.
    pub const ALLOW_PARTIAL_FAILURE: &str = "ALLOW_PARTIAL_FAILURE";
}

impl FleetSettings {
    /// Override fields from environment variables that are set.
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn with_env(mut self, env: &EnvConfig) -> Self {
        if let Some(n) = env.parse::<usize>(vars::MAX_PARALLEL_ACTIONS).filter(|n| *n > 0) {
            self.max_parallel_actions = n;
        }
        if let Some(t) = env.duration_secs(vars::CONNECT_TIMEOUT) {
            self.connect_timeout = t;
        }
        if let Some(b) = env.bool(vars::USE_SSH_CONFIG) {
            self.use_ssh_config = b;
        }
        if let Some(p) = env.get(vars::SSH_CONFIG_FILE_PATH) {
            self.ssh_config_file_path = Some(PathBuf::from(p));
        }
        if let Some(raw) = env.get(vars::HOST_KEY_VERIFICATION) {
            match raw.parse() {
                Ok(policy) => self.host_key_verification = policy,
                Err(e) => tracing::warn!(error = %e, "Ignoring host key verification override"),
            }
        }
        if let Some(port) = env.parse::<u16>(vars::DEFAULT_PORT).filter(|p| *p > 0) {
            self.default_port = port;
        }
        if let Some(b) = env.bool(vars::ALLOW_PARTIAL_FAILURE) {
            self.allow_partial_failure = b;
        }
        self
    }
}

/// Get a standard environment variable.
#[must_use]
pub fn get_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Get the current user.
#[must_use]
pub fn current_user() -> Option<String> {
    get_env("USER").or_else(|| get_env("USERNAME"))
}

/// Get the home directory.
#[must_use]
pub fn home_dir() -> Option<PathBuf> {
    get_env("HOME")
        .or_else(|| get_env("USERPROFILE"))
        .map(PathBuf::from)
}

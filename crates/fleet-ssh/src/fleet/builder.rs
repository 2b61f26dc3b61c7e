//! Builder for [`FleetCoordinator`].

use std::path::PathBuf;
use std::time::Duration;

use super::{FleetCoordinator, parallel_concurrency};
use crate::auth::Credentials;
use crate::config::FleetSettings;
use crate::error::{FleetError, FleetResult};
use crate::host::{HostAddr, parse_hosts};
use crate::output::LineHandler;
use crate::remote::Connector;
use crate::ssh::SshConnector;

/// Builder for a [`FleetCoordinator`].
///
/// Exactly one credential form may be given: a password, a `private_key`
/// (key data or a key file path), or one or more key files. With none, the
/// SSH agent and the default identity files are used.
#[must_use]
pub struct FleetBuilder {
    hosts: Vec<String>,
    username: Option<String>,
    password: Option<String>,
    private_key: Option<String>,
    key_files: Vec<PathBuf>,
    passphrase: Option<String>,
    bastion: Option<String>,
    concurrency: Option<usize>,
    settings: FleetSettings,
    sudo_password_detection: bool,
    raise_on_any_error: bool,
    connect: bool,
    command_timeout: Option<Duration>,
    stdout_handler: Option<LineHandler>,
    stderr_handler: Option<LineHandler>,
}

impl std::fmt::Debug for FleetBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetBuilder")
            .field("hosts", &self.hosts)
            .field("username", &self.username)
            .field("key_files", &self.key_files)
            .field("bastion", &self.bastion)
            .field("concurrency", &self.concurrency)
            .field("connect", &self.connect)
            .finish_non_exhaustive()
    }
}

struct Resolved {
    hosts: Vec<HostAddr>,
    concurrency: usize,
    sudo_password_detection: bool,
    allow_partial_failure: bool,
}

impl FleetBuilder {
    /// Start with a host list.
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            username: None,
            password: None,
            private_key: None,
            key_files: Vec::new(),
            passphrase: None,
            bastion: None,
            concurrency: None,
            settings: FleetSettings::load(None).unwrap_or_default(),
            sudo_password_detection: false,
            raise_on_any_error: false,
            connect: true,
            command_timeout: None,
            stdout_handler: None,
            stderr_handler: None,
        }
    }

    /// Login user. Without one, the OpenSSH config `User` applies when the
    /// config is consulted, then `$USER`.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Password authentication.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Private key data, or the path of a key file.
    pub fn private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    /// Add a key file to try.
    pub fn key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_files.push(path.into());
        self
    }

    /// Passphrase for an encrypted private key.
    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Relay every connection through a bastion host.
    pub fn bastion(mut self, bastion: impl Into<String>) -> Self {
        self.bastion = Some(bastion.into());
        self
    }

    /// Cap on concurrent per-host tasks; never above
    /// `max_parallel_actions`.
    pub const fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Operator settings; environment overrides are not reapplied.
    pub fn settings(mut self, settings: FleetSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Fail hosts whose stderr shows a rejected sudo password.
    pub const fn sudo_password_detection(mut self, enabled: bool) -> Self {
        self.sudo_password_detection = enabled;
        self
    }

    /// Abort connecting on the first host that fails.
    pub const fn raise_on_any_error(mut self, enabled: bool) -> Self {
        self.raise_on_any_error = enabled;
        self
    }

    /// Whether [`open`](Self::open) connects right away (the default).
    pub const fn connect(mut self, enabled: bool) -> Self {
        self.connect = enabled;
        self
    }

    /// Timeout commands will run with; connects are kept shorter.
    pub const fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Per-line stdout callback.
    pub fn stdout_handler(mut self, handler: LineHandler) -> Self {
        self.stdout_handler = Some(handler);
        self
    }

    /// Per-line stderr callback.
    pub fn stderr_handler(mut self, handler: LineHandler) -> Self {
        self.stderr_handler = Some(handler);
        self
    }

    fn credentials(&mut self) -> FleetResult<Credentials> {
        let given = [
            self.password.is_some(),
            self.private_key.is_some(),
            !self.key_files.is_empty(),
        ];
        if given.iter().filter(|g| **g).count() > 1 {
            return Err(FleetError::config(
                "only one of password, private_key and key files may be given",
            ));
        }

        let credentials = if let Some(password) = self.password.take() {
            Credentials::Password(password)
        } else if let Some(key) = self.private_key.take() {
            Credentials::from_private_key_param(key)
        } else if !self.key_files.is_empty() {
            Credentials::key_files(std::mem::take(&mut self.key_files))
        } else {
            Credentials::Default
        };

        match self.passphrase.take() {
            Some(passphrase) => credentials.with_passphrase(passphrase),
            None => Ok(credentials),
        }
    }

    fn resolve(&self) -> FleetResult<Resolved> {
        let hosts = parse_hosts(&self.hosts, self.settings.default_port)?;
        let max = self.settings.max_parallel_actions;
        let concurrency = match self.concurrency {
            Some(0) => return Err(FleetError::config("concurrency must be at least 1")),
            Some(n) => n.min(max.max(1)),
            None => parallel_concurrency(hosts.len(), true, max),
        };
        Ok(Resolved {
            hosts,
            concurrency,
            sudo_password_detection: self.sudo_password_detection,
            allow_partial_failure: self.settings.allow_partial_failure,
        })
    }

    /// Build a coordinator over SSH without connecting.
    pub fn build(mut self) -> FleetResult<FleetCoordinator<SshConnector>> {
        let resolved = self.resolve()?;
        let credentials = self.credentials()?;
        let bastion = self
            .bastion
            .as_deref()
            .map(|b| HostAddr::parse(b, self.settings.default_port))
            .transpose()?;
        let connector = SshConnector::new(self.username.take(), credentials, self.settings)
            .bastion(bastion)
            .line_handlers(self.stdout_handler, self.stderr_handler);
        let connector = match self.command_timeout {
            Some(timeout) => connector.command_timeout(Some(timeout)),
            None => connector,
        };

        Ok(FleetCoordinator::new(
            resolved.hosts,
            connector,
            resolved.concurrency,
            resolved.sudo_password_detection,
            resolved.allow_partial_failure,
        ))
    }

    /// Build a coordinator over any [`Connector`] without connecting.
    ///
    /// Credentials are still validated; how they are used is up to the
    /// connector.
    pub fn build_with<C: Connector>(mut self, connector: C) -> FleetResult<FleetCoordinator<C>> {
        let resolved = self.resolve()?;
        self.credentials()?;
        Ok(FleetCoordinator::new(
            resolved.hosts,
            connector,
            resolved.concurrency,
            resolved.sudo_password_detection,
            resolved.allow_partial_failure,
        ))
    }

    /// Build over SSH and, unless disabled, connect every host.
    pub async fn open(self) -> FleetResult<FleetCoordinator<SshConnector>> {
        let (connect, raise) = (self.connect, self.raise_on_any_error);
        let mut fleet = self.build()?;
        if connect {
            fleet.connect(raise).await?;
        }
        Ok(fleet)
    }

    /// Build over `connector` and, unless disabled, connect every host.
    pub async fn open_with<C: Connector>(self, connector: C) -> FleetResult<FleetCoordinator<C>> {
        let (connect, raise) = (self.connect, self.raise_on_any_error);
        let mut fleet = self.build_with(connector)?;
        if connect {
            fleet.connect(raise).await?;
        }
        Ok(fleet)
    }
}

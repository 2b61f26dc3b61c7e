//! One authenticated SSH connection to one host.

use std::borrow::Cow;
use std::path::Path;
use std::time::Duration;

use russh::client;
use russh::keys::PrivateKeyWithHashAlg;
use russh_sftp::client::SftpSession;

use super::exec::{self, Drained};
use super::handler::ClientHandler;
use super::sftp;
use super::tunnel::{self, BastionRelay, DirectTcp, ProxyCommand, StreamFactory};
use crate::auth::{AuthMethod, Credentials};
use crate::config::env::current_user;
use crate::config::ssh_config::SshClientConfig;
use crate::config::{CLOSE_TIMEOUT, DEFAULT_PORT, FleetSettings, POLL_INTERVAL, SessionConfig};
use crate::error::{Result, SshError};
use crate::host::HostAddr;
use crate::output::{LineBuffer, LineHandler, sanitize_output};
use crate::redact::sanitize_command;
use crate::remote::{Connector, PutOptions, RemoteSession};
use crate::result::{CommandResult, DirRemoval, FAILURE_RETURN_CODE, MISSING_EXIT_STATUS, RemoteFile};

/// Where and as whom a session connects, after OpenSSH config lookup.
#[derive(Debug, Clone)]
struct Target {
    hostname: String,
    port: u16,
    username: String,
    credentials: Credentials,
    proxy_command: Option<String>,
}

impl Target {
    /// The login user is the configured one, else the OpenSSH config `User`,
    /// else `$USER`.
    fn resolve(config: &SessionConfig) -> Self {
        let mut target = Self {
            hostname: config.host.hostname().to_string(),
            port: config.host.port(),
            username: config.username.clone(),
            credentials: config.credentials.clone(),
            proxy_command: None,
        };
        if let Some(path) = &config.ssh_config_path {
            target.apply_ssh_config(path, config.host.hostname());
        }
        if target.username.is_empty() {
            target.username = current_user().unwrap_or_default();
        }
        target
    }

    fn apply_ssh_config(&mut self, path: &Path, alias: &str) {
        let ssh_config = match SshClientConfig::load(path) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable ssh config");
                return;
            }
        };

        let options = ssh_config.lookup(alias);
        if self.username.is_empty() {
            if let Some(user) = options.user {
                self.username = user;
            }
        }
        if self.port == DEFAULT_PORT {
            if let Some(port) = options.port {
                self.port = port;
            }
        }
        if let Some(hostname) = options.hostname {
            self.hostname = hostname;
        }
        if matches!(self.credentials, Credentials::Default) && !options.identity_files.is_empty() {
            self.credentials = Credentials::key_files(options.identity_files);
        }
        self.proxy_command = options.proxy_command;
    }
}

/// An SSH session to a single host.
///
/// Commands run on fresh exec channels; file operations share one SFTP
/// channel opened on first use. With a bastion configured, the session also
/// owns the bastion connection and closes it last.
pub struct SshSession {
    config: SessionConfig,
    handle: Option<client::Handle<ClientHandler>>,
    bastion: Option<client::Handle<ClientHandler>>,
    sftp: Option<SftpSession>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host", &self.config.host)
            .field("connected", &self.handle.is_some())
            .field("via_bastion", &self.bastion.is_some())
            .field("sftp_open", &self.sftp.is_some())
            .finish()
    }
}

impl SshSession {
    /// A session that has not connected yet.
    fn disconnected(config: SessionConfig) -> Self {
        Self {
            config,
            handle: None,
            bastion: None,
            sftp: None,
        }
    }

    /// Connect and authenticate.
    ///
    /// Private keys are decoded first, so key problems fail before any
    /// network traffic. The whole connect phase, bastion leg included, is
    /// bounded by the connect timeout. Nothing is retried.
    ///
    /// A bastion takes precedence over an OpenSSH config `ProxyCommand`.
    pub async fn connect(config: SessionConfig) -> Result<Self> {
        Self::connect_via(config, &mut DirectTcp).await
    }

    /// Connect, opening plain connections (to the target, or to the
    /// bastion) with `direct`.
    async fn connect_via<D: StreamFactory>(config: SessionConfig, direct: &mut D) -> Result<Self> {
        let target = Target::resolve(&config);
        let plan = target.credentials.auth_plan().await?;
        if plan.is_empty() {
            return Err(SshError::Authentication {
                user: target.username,
                reason: "no authentication method available".to_string(),
            });
        }

        tracing::debug!(
            host = %config.host,
            port = target.port,
            user = %target.username,
            credentials = config.credentials.kind(),
            bastion = ?config.bastion.as_ref().map(HostAddr::identity),
            "Connecting to host"
        );

        let mut session = Self::disconnected(config);
        let timeout = session.config.connect_timeout;
        let established = tokio::time::timeout(timeout, session.establish(direct, &target, &plan)).await;
        match established {
            Ok(Ok(())) => {
                tracing::info!(
                    host = %session.config.host,
                    user = %target.username,
                    "SSH connection established"
                );
                Ok(session)
            }
            Ok(Err(e)) => {
                session.shutdown().await;
                Err(e)
            }
            Err(_) => {
                session.shutdown().await;
                Err(SshError::ConnectTimeout {
                    host: target.hostname,
                    port: target.port,
                    timeout,
                })
            }
        }
    }

    async fn establish<D: StreamFactory>(
        &mut self,
        direct: &mut D,
        target: &Target,
        plan: &[AuthMethod],
    ) -> Result<()> {
        let policy = self.config.host_key_verification;
        let (handler, rejected) = ClientHandler::new(&target.hostname, target.port, policy);

        let mut handle = match self.config.bastion.clone() {
            None => match &target.proxy_command {
                Some(command) => {
                    let mut proxy = ProxyCommand::new(command.as_str(), target.username.as_str());
                    tunnel::handshake(&mut proxy, &target.hostname, target.port, handler, &rejected)
                        .await?
                }
                None => {
                    tunnel::handshake(direct, &target.hostname, target.port, handler, &rejected)
                        .await?
                }
            },
            Some(bastion) => {
                if target.proxy_command.is_some() {
                    tracing::debug!(host = %self.config.host, "Bastion set; ignoring ProxyCommand");
                }
                let wrap = |e: SshError| SshError::Bastion {
                    bastion: bastion.identity().to_string(),
                    source: Box::new(e),
                };
                let (jump_handler, jump_rejected) =
                    ClientHandler::new(bastion.hostname(), bastion.port(), policy);
                let mut jump = tunnel::handshake(
                    direct,
                    bastion.hostname(),
                    bastion.port(),
                    jump_handler,
                    &jump_rejected,
                )
                .await
                .map_err(wrap)?;
                authenticate(&mut jump, &target.username, plan)
                    .await
                    .map_err(wrap)?;
                tracing::debug!(host = %self.config.host, bastion = %bastion, "Bastion authenticated");

                let jump = self.bastion.insert(jump);
                let mut relay = BastionRelay::new(jump, bastion.identity());
                tunnel::handshake(&mut relay, &target.hostname, target.port, handler, &rejected).await?
            }
        };

        authenticate(&mut handle, &target.username, plan).await?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Host this session targets.
    #[must_use]
    pub const fn host(&self) -> &HostAddr {
        &self.config.host
    }

    /// Whether the session is connected.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    fn handle(&self) -> Result<&client::Handle<ClientHandler>> {
        self.handle.as_ref().ok_or(SshError::NotConnected)
    }

    /// The shared SFTP channel, opened on first use.
    async fn sftp(&mut self) -> Result<&SftpSession> {
        if self.sftp.is_none() {
            let opened = sftp::open(self.handle()?).await?;
            self.sftp = Some(opened);
        }
        self.sftp.as_ref().ok_or(SshError::NotConnected)
    }

    async fn shutdown(&mut self) {
        if let Some(sftp) = self.sftp.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, sftp.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(host = %self.config.host, error = %e, "SFTP close failed"),
                Err(_) => tracing::debug!(host = %self.config.host, "SFTP close timed out"),
            }
        }
        let target = self.handle.take().map(|h| ("host", h));
        let bastion = self.bastion.take().map(|h| ("bastion", h));
        for (leg, handle) in target.into_iter().chain(bastion) {
            let disconnect = handle.disconnect(russh::Disconnect::ByApplication, "", "en");
            match tokio::time::timeout(CLOSE_TIMEOUT, disconnect).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(host = %self.config.host, leg = leg, error = %e, "Disconnect failed");
                }
                Err(_) => tracing::warn!(host = %self.config.host, leg = leg, "Disconnect timed out"),
            }
        }
    }
}

impl RemoteSession for SshSession {
    async fn run(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
        quote: bool,
    ) -> Result<CommandResult> {
        let command = if quote {
            shell_quote(command)
        } else {
            command.to_string()
        };
        let pty = command.trim_start().starts_with("sudo");
        tracing::debug!(
            host = %self.config.host,
            command = %sanitize_command(&command),
            pty = pty,
            "Running command"
        );

        let mut channel = self
            .handle()?
            .channel_open_session()
            .await
            .map_err(|e| SshError::protocol(format!("failed to open channel: {e}")))?;
        if pty {
            channel
                .request_pty(false, "vt100", 80, 24, 0, 0, &[])
                .await
                .map_err(|e| SshError::protocol(format!("failed to request pty: {e}")))?;
        }
        channel
            .exec(false, command.as_str())
            .await
            .map_err(|e| SshError::protocol(format!("failed to exec: {e}")))?;
        // Nothing is ever written to stdin; prompting commands get EOF.
        channel
            .eof()
            .await
            .map_err(|e| SshError::protocol(format!("failed to send EOF: {e}")))?;

        let mut stdout_lines = LineBuffer::new(self.config.stdout_handler.clone());
        let mut stderr_lines = LineBuffer::new(self.config.stderr_handler.clone());
        let drained = exec::drain(
            &mut channel,
            timeout,
            POLL_INTERVAL,
            &mut stdout_lines,
            &mut stderr_lines,
        )
        .await;

        match drained {
            Drained::Finished(raw) => {
                let return_code = raw.exit_status.map_or(MISSING_EXIT_STATUS, |code| {
                    i32::try_from(code).unwrap_or(FAILURE_RETURN_CODE)
                });
                Ok(CommandResult::new(
                    sanitize_output(&raw.stdout, pty),
                    sanitize_output(&raw.stderr, pty),
                    return_code,
                ))
            }
            Drained::TimedOut(raw) => {
                tracing::warn!(
                    host = %self.config.host,
                    command = %sanitize_command(&command),
                    "Command timed out"
                );
                Err(SshError::CommandTimeout {
                    command: sanitize_command(&command).into_owned(),
                    timeout: timeout.unwrap_or_default(),
                    connect_timeout: self.config.connect_timeout,
                    stdout: sanitize_output(&raw.stdout, pty),
                    stderr: sanitize_output(&raw.stderr, pty),
                })
            }
        }
    }

    async fn put(&mut self, local: &Path, remote: &str, options: PutOptions) -> Result<RemoteFile> {
        let sftp = self.sftp().await?;
        sftp::upload_file(sftp, local, remote, options).await
    }

    async fn put_dir(
        &mut self,
        local: &Path,
        remote: &str,
        options: PutOptions,
    ) -> Result<Vec<RemoteFile>> {
        let sftp = self.sftp().await?;
        sftp::upload_tree(sftp, local, remote, options).await
    }

    async fn mkdir(&mut self, path: &str) -> Result<()> {
        let path = shell_quote(path);
        tracing::debug!(host = %self.config.host, path = %path, "mkdir");
        let sftp = self.sftp().await?;
        sftp.create_dir(path.as_str())
            .await
            .map_err(|e| sftp::map_error(&path, e))
    }

    async fn delete_file(&mut self, path: &str) -> Result<()> {
        let path = shell_quote(path);
        tracing::debug!(host = %self.config.host, path = %path, "Deleting file");
        let sftp = self.sftp().await?;
        sftp.remove_file(path.as_str())
            .await
            .map_err(|e| sftp::map_error(&path, e))
    }

    async fn delete_dir(
        &mut self,
        path: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<DirRemoval> {
        tracing::debug!(host = %self.config.host, path = %path, force = force, "Deleting dir");
        if force {
            let command = format!("rm -rf {}", shell_quote(path));
            return self.run(&command, timeout, false).await.map(DirRemoval::Command);
        }
        let sftp = self.sftp().await?;
        sftp.remove_dir(path)
            .await
            .map_err(|e| sftp::map_error(path, e))?;
        Ok(DirRemoval::Removed)
    }

    async fn exists(&mut self, path: &str) -> Result<bool> {
        let sftp = self.sftp().await?;
        sftp::exists(sftp, path).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.handle.is_some() || self.bastion.is_some() {
            tracing::debug!(host = %self.config.host, "Closing session");
        }
        self.shutdown().await;
        Ok(())
    }
}

fn shell_quote(value: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(value)).into_owned()
}

/// Try each method in order until one is accepted.
async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    user: &str,
    plan: &[AuthMethod],
) -> Result<()> {
    for method in plan {
        tracing::debug!(user = %user, method = method.name(), "Attempting authentication");
        let accepted = match method {
            AuthMethod::Password(password) => {
                match handle.authenticate_password(user, password).await {
                    Ok(result) => result.success(),
                    Err(e) => {
                        tracing::debug!(user = %user, error = %e, "Password authentication error");
                        false
                    }
                }
            }
            AuthMethod::PublicKey(loaded) => {
                let rsa_hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                let key = PrivateKeyWithHashAlg::new(std::sync::Arc::clone(&loaded.key), rsa_hash);
                match handle.authenticate_publickey(user, key).await {
                    Ok(result) => result.success(),
                    Err(e) => {
                        tracing::debug!(
                            user = %user,
                            key = %loaded.origin,
                            error = %e,
                            "Public key authentication error"
                        );
                        false
                    }
                }
            }
            AuthMethod::Agent => authenticate_with_agent(handle, user).await,
        };
        if accepted {
            tracing::debug!(user = %user, method = method.name(), "Authentication successful");
            return Ok(());
        }
    }

    let tried: Vec<&str> = plan.iter().map(AuthMethod::name).collect();
    Err(SshError::Authentication {
        user: user.to_string(),
        reason: format!("all authentication methods exhausted ({})", tried.join(", ")),
    })
}

#[cfg(unix)]
async fn authenticate_with_agent(handle: &mut client::Handle<ClientHandler>, user: &str) -> bool {
    let mut agent = match russh::keys::agent::client::AgentClient::connect_env().await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::debug!(user = %user, error = %e, "Failed to connect to SSH agent");
            return false;
        }
    };
    let identities = match agent.request_identities().await {
        Ok(keys) => keys,
        Err(e) => {
            tracing::debug!(user = %user, error = %e, "Failed to get identities from SSH agent");
            return false;
        }
    };
    tracing::debug!(user = %user, key_count = identities.len(), "Found keys in SSH agent");

    for key in identities {
        let rsa_hash = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        match handle
            .authenticate_publickey_with(user, key.clone(), rsa_hash, &mut agent)
            .await
        {
            Ok(result) if result.success() => return true,
            Ok(_) => {
                tracing::debug!(
                    user = %user,
                    key_type = %key.algorithm().as_str(),
                    "SSH agent key rejected, trying next"
                );
            }
            Err(e) => tracing::debug!(user = %user, error = %e, "SSH agent authentication error"),
        }
    }
    false
}

#[cfg(not(unix))]
async fn authenticate_with_agent(_handle: &mut client::Handle<ClientHandler>, user: &str) -> bool {
    tracing::debug!(user = %user, "SSH agent authentication not supported on this platform");
    false
}

/// Opens [`SshSession`]s with shared credentials and settings.
#[derive(Clone)]
pub struct SshConnector {
    username: Option<String>,
    credentials: Credentials,
    bastion: Option<HostAddr>,
    settings: FleetSettings,
    command_timeout: Option<Duration>,
    stdout_handler: Option<LineHandler>,
    stderr_handler: Option<LineHandler>,
}

impl std::fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnector")
            .field("username", &self.username)
            .field("credentials", &self.credentials)
            .field("bastion", &self.bastion)
            .field("settings", &self.settings)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl SshConnector {
    /// Create a connector. Without a `username` each session resolves its
    /// own login user.
    pub fn new(username: Option<String>, credentials: Credentials, settings: FleetSettings) -> Self {
        Self {
            username,
            credentials,
            bastion: None,
            settings,
            command_timeout: None,
            stdout_handler: None,
            stderr_handler: None,
        }
    }

    /// Relay every connection through `bastion`.
    #[must_use]
    pub fn bastion(mut self, bastion: Option<HostAddr>) -> Self {
        self.bastion = bastion;
        self
    }

    /// Timeout commands will run with; the connect timeout is kept below it.
    #[must_use]
    pub const fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Per-line output callbacks.
    #[must_use]
    pub fn line_handlers(mut self, stdout: Option<LineHandler>, stderr: Option<LineHandler>) -> Self {
        self.stdout_handler = stdout;
        self.stderr_handler = stderr;
        self
    }

    /// Session configuration for `host`.
    #[must_use]
    pub fn session_config(&self, host: &HostAddr) -> SessionConfig {
        let mut config = SessionConfig::new(host.clone(), self.username.clone().unwrap_or_default())
            .credentials(self.credentials.clone())
            .connect_timeout(self.settings.connect_timeout)
            .host_key_verification(self.settings.host_key_verification)
            .clamp_to_command_timeout(self.command_timeout);
        if self.settings.use_ssh_config {
            config = config.ssh_config_path(self.settings.ssh_config_path());
        }
        if let Some(bastion) = &self.bastion {
            config = config.bastion(bastion.clone());
        }
        config.stdout_handler = self.stdout_handler.clone();
        config.stderr_handler = self.stderr_handler.clone();
        config
    }
}

impl Connector for SshConnector {
    type Session = SshSession;

    async fn connect(&self, host: &HostAddr) -> Result<SshSession> {
        SshSession::connect(self.session_config(host)).await
    }
}

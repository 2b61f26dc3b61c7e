//! Fleet-level coordination.
//!
//! A [`FleetCoordinator`] owns a host list and one session per reachable
//! host. Every operation fans out to the connected hosts through a bounded
//! [`Wave`](pool::Wave) and comes back as one [`FleetResults`] map with an
//! entry for every host. Hosts that failed to connect are quarantined: their
//! connect error is repeated in every later map and they are never retried.

mod builder;
pub mod pool;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

pub use builder::FleetBuilder;
use pool::Wave;

use crate::error::{FleetError, FleetResult, Result, SshError};
use crate::host::HostAddr;
use crate::redact::sanitize_command;
use crate::remote::{Connector, PutOptions, RemoteSession};
use crate::result::{
    CommandResult, ConnectResult, DirRemoval, ErrorResult, ExecutionStatus, FleetResults,
    HostOutcome, Outcome, RemoteFile, overall_status, sudo_password_failure,
};
use crate::ssh::SshConnector;

/// Concurrency a runner uses for `host_count` hosts: a third of the hosts
/// plus one when running in parallel, one otherwise, never above `max`.
#[must_use]
pub fn parallel_concurrency(host_count: usize, parallel: bool, max: usize) -> usize {
    let wanted = if parallel { host_count / 3 + 1 } else { 1 };
    wanted.min(max.max(1))
}

/// Runs operations across a fleet of hosts.
pub struct FleetCoordinator<C: Connector = SshConnector> {
    hosts: Vec<HostAddr>,
    connector: Arc<C>,
    concurrency: usize,
    sudo_password_detection: bool,
    allow_partial_failure: bool,
    sessions: BTreeMap<String, Arc<Mutex<C::Session>>>,
    bad_hosts: BTreeMap<String, ErrorResult>,
    attempted: BTreeSet<String>,
}

impl<C: Connector> std::fmt::Debug for FleetCoordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetCoordinator")
            .field("hosts", &self.hosts)
            .field("concurrency", &self.concurrency)
            .field("connected", &self.sessions.keys().collect::<Vec<_>>())
            .field("bad_hosts", &self.bad_hosts.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl FleetCoordinator<SshConnector> {
    /// Start building a coordinator for `hosts`.
    pub fn builder<I, S>(hosts: I) -> FleetBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FleetBuilder::new(hosts)
    }
}

impl<C: Connector> FleetCoordinator<C> {
    pub(crate) fn new(
        hosts: Vec<HostAddr>,
        connector: C,
        concurrency: usize,
        sudo_password_detection: bool,
        allow_partial_failure: bool,
    ) -> Self {
        Self {
            hosts,
            connector: Arc::new(connector),
            concurrency: concurrency.max(1),
            sudo_password_detection,
            allow_partial_failure,
            sessions: BTreeMap::new(),
            bad_hosts: BTreeMap::new(),
            attempted: BTreeSet::new(),
        }
    }

    /// Hosts of this fleet, in the order supplied.
    #[must_use]
    pub fn hosts(&self) -> &[HostAddr] {
        &self.hosts
    }

    /// Upper bound on concurrent per-host tasks.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Number of hosts with a live session.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.sessions.len()
    }

    /// Connector new sessions are opened with.
    #[must_use]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Overall status of a result map under this fleet's
    /// `allow_partial_failure` setting.
    #[must_use]
    pub fn status<T: Outcome>(&self, results: &FleetResults<T>) -> ExecutionStatus {
        overall_status(results, self.allow_partial_failure)
    }

    /// Quarantined hosts and their connect errors.
    #[must_use]
    pub const fn bad_hosts(&self) -> &BTreeMap<String, ErrorResult> {
        &self.bad_hosts
    }

    /// Connect every host not attempted before.
    ///
    /// With `raise_on_any_error` the first failure cancels the remaining
    /// connects and is returned. Fails with
    /// [`FleetError::NoHostsReachable`] when no host is connected afterward.
    pub async fn connect(
        &mut self,
        raise_on_any_error: bool,
    ) -> FleetResult<FleetResults<ConnectResult>> {
        let mut results = FleetResults::new();
        let mut wave = Wave::new(self.concurrency);

        for host in &self.hosts {
            let id = host.identity();
            if let Some(err) = self.bad_hosts.get(id) {
                results.insert(id.to_string(), HostOutcome::Err(err.clone()));
            } else if self.sessions.contains_key(id) {
                results.insert(id.to_string(), HostOutcome::Ok(ConnectResult::default()));
            } else if !self.attempted.contains(id) {
                let connector = Arc::clone(&self.connector);
                let host = host.clone();
                wave.spawn(id.to_string(), async move { connector.connect(&host).await });
            }
        }

        while let Some((host, outcome)) = wave.next().await {
            self.attempted.insert(host.clone());
            let err = match flatten(outcome) {
                Ok(session) => {
                    tracing::info!(host = %host, "Connected to host");
                    self.sessions.insert(host.clone(), Arc::new(Mutex::new(session)));
                    results.insert(host, HostOutcome::Ok(ConnectResult::default()));
                    continue;
                }
                Err(err) => err,
            };

            tracing::error!(host = %host, error = %err, "Failed connecting to host");
            let result = ErrorResult::from_error(&connect_context(&host, &err), &err);
            self.bad_hosts.insert(host.clone(), result.clone());
            results.insert(host.clone(), HostOutcome::Err(result));

            if raise_on_any_error {
                wave.abort();
                return Err(FleetError::HostConnect { host, source: err });
            }
        }

        self.fill_unattempted(&mut results);

        if self.sessions.is_empty() {
            let details = serde_json::to_string_pretty(&self.bad_hosts).unwrap_or_default();
            return Err(FleetError::NoHostsReachable {
                hosts: self.hosts.iter().map(|h| h.identity().to_string()).collect(),
                details,
            });
        }
        Ok(results)
    }

    /// Run `command` on every connected host.
    ///
    /// `quote` shell-quotes the command first. With sudo password detection
    /// enabled, a host whose stderr shows rejected sudo passwords fails with
    /// [`SshError::SudoPassword`].
    pub async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
        quote: bool,
    ) -> FleetResults<CommandResult> {
        let sanitized = sanitize_command(command).into_owned();
        tracing::debug!(command = %sanitized, hosts = self.sessions.len(), "Running command on fleet");

        let command = Arc::<str>::from(command);
        let detect_sudo = self.sudo_password_detection;
        self.fan_out(
            |host| format!("Failed executing command \"{sanitized}\" on host \"{host}\""),
            move |session| {
                let command = Arc::clone(&command);
                async move {
                    let result = session.lock().await.run(&command, timeout, quote).await?;
                    if detect_sudo {
                        if let Some(user) = sudo_password_failure(&result.stderr) {
                            return Err(SshError::SudoPassword { user });
                        }
                    }
                    Ok(result)
                }
            },
        )
        .await
    }

    /// Upload a file or a directory tree to every connected host.
    ///
    /// Fails before contacting any host when `local` does not exist.
    pub async fn put(
        &self,
        local: &Path,
        remote: &str,
        options: PutOptions,
    ) -> FleetResult<FleetResults<Vec<RemoteFile>>> {
        if !local.exists() {
            return Err(FleetError::LocalPathMissing {
                path: local.to_path_buf(),
            });
        }
        let is_dir = local.is_dir();
        let local_display = local.display().to_string();
        let local = Arc::new(local.to_path_buf());
        let remote = Arc::<str>::from(remote);

        Ok(self
            .fan_out(
                |host| format!("Failed sending file(s) in path {local_display} to host {host}"),
                move |session| {
                    let local = Arc::clone(&local);
                    let remote = Arc::clone(&remote);
                    async move {
                        let mut session = session.lock().await;
                        if is_dir {
                            session.put_dir(&local, &remote, options).await
                        } else {
                            session.put(&local, &remote, options).await.map(|f| vec![f])
                        }
                    }
                },
            )
            .await)
    }

    /// Create a directory on every connected host.
    pub async fn mkdir(&self, path: &str) -> FleetResults<()> {
        let path = Arc::<str>::from(path);
        let shown = Arc::clone(&path);
        self.fan_out(
            |host| format!("Failed \"mkdir {shown}\" on host {host}."),
            move |session| {
                let path = Arc::clone(&path);
                async move { session.lock().await.mkdir(&path).await }
            },
        )
        .await
    }

    /// Delete a file on every connected host.
    pub async fn delete_file(&self, path: &str) -> FleetResults<()> {
        let path = Arc::<str>::from(path);
        let shown = Arc::clone(&path);
        self.fan_out(
            |host| format!("Failed deleting file {shown} on host {host}."),
            move |session| {
                let path = Arc::clone(&path);
                async move { session.lock().await.delete_file(&path).await }
            },
        )
        .await
    }

    /// Delete a directory on every connected host; `force` removes its
    /// contents too.
    pub async fn delete_dir(
        &self,
        path: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> FleetResults<DirRemoval> {
        let path = Arc::<str>::from(path);
        let shown = Arc::clone(&path);
        self.fan_out(
            |host| format!("Failed deleting dir {shown} on host {host}."),
            move |session| {
                let path = Arc::clone(&path);
                async move { session.lock().await.delete_dir(&path, force, timeout).await }
            },
        )
        .await
    }

    /// Close every session. Failures are logged and never returned; calling
    /// this again, or before connecting, does nothing.
    pub async fn close(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        tracing::debug!(sessions = self.sessions.len(), "Closing fleet sessions");

        let mut wave = Wave::new(self.concurrency);
        for (host, session) in std::mem::take(&mut self.sessions) {
            wave.spawn(host, async move { session.lock().await.close().await });
        }
        while let Some((host, outcome)) = wave.next().await {
            if let Err(e) = flatten(outcome) {
                tracing::warn!(host = %host, error = %e, "Failed to close session");
            }
        }
    }

    /// Fan `op` out to every connected host and collect one entry per host.
    async fn fan_out<T, F, Fut>(
        &self,
        context: impl Fn(&str) -> String,
        op: F,
    ) -> FleetResults<T>
    where
        T: Send + 'static,
        F: Fn(Arc<Mutex<C::Session>>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut results: FleetResults<T> = self
            .bad_hosts
            .iter()
            .map(|(host, err)| (host.clone(), HostOutcome::Err(err.clone())))
            .collect();

        let mut wave = Wave::new(self.concurrency);
        for (host, session) in &self.sessions {
            wave.spawn(host.clone(), op(Arc::clone(session)));
        }

        while let Some((host, outcome)) = wave.next().await {
            let entry = match flatten(outcome) {
                Ok(value) => HostOutcome::Ok(value),
                Err(err) => {
                    if err.is_timeout() {
                        tracing::warn!(host = %host, error = %err, "Operation timed out");
                    } else {
                        tracing::error!(host = %host, error = %err, "Operation failed");
                    }
                    HostOutcome::Err(ErrorResult::from_error(&context(&host), &err))
                }
            };
            results.insert(host, entry);
        }

        self.fill_unattempted(&mut results);
        results
    }

    /// Give every host still missing from `results` a "not connected" entry.
    fn fill_unattempted<T>(&self, results: &mut FleetResults<T>) {
        for host in &self.hosts {
            results.entry(host.identity().to_string()).or_insert_with(|| {
                HostOutcome::Err(ErrorResult::from_error(
                    &format!("Skipped host {host}."),
                    &SshError::NotConnected,
                ))
            });
        }
    }
}

/// Fold a worker panic into a per-host error.
fn flatten<T>(outcome: pool::TaskOutcome<Result<T>>) -> Result<T> {
    outcome.unwrap_or_else(|panic| Err(SshError::protocol(format!("worker panicked: {panic}"))))
}

/// Message prefixed to a connect error: transport level failures name the
/// host, SSH level failures are a generic connection error.
fn connect_context(host: &str, err: &SshError) -> String {
    match err {
        SshError::Connection { .. } | SshError::ConnectTimeout { .. } | SshError::Bastion { .. } => {
            format!("Failed connecting to host {host}.")
        }
        _ => "Connection error.".to_string(),
    }
}

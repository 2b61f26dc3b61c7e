//! Scripted in-memory hosts for fleet tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_ssh::redact::sanitize_command;
use fleet_ssh::{
    CommandResult, Connector, DirRemoval, HostAddr, PutOptions, RemoteFile, RemoteSession,
    Result, SshError,
};

/// How a scripted host answers commands.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Print the login user, like `whoami`.
    User,
    /// Fixed output and exit code.
    Output {
        stdout: String,
        stderr: String,
        code: i32,
    },
    /// Print `partial` and never finish.
    Hang { partial: String },
    /// Fail with a protocol error.
    Broken(String),
}

/// One scripted host.
#[derive(Debug, Clone)]
pub struct HostScript {
    pub reachable: bool,
    pub reply: Reply,
    pub latency: Duration,
}

impl Default for HostScript {
    fn default() -> Self {
        Self {
            reachable: true,
            reply: Reply::User,
            latency: Duration::ZERO,
        }
    }
}

impl HostScript {
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::default()
        }
    }

    pub fn replying(reply: Reply) -> Self {
        Self {
            reply,
            ..Self::default()
        }
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// Counters shared by a connector and every session it opened.
#[derive(Debug, Default)]
pub struct Ledger {
    pub connects: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
    pub running: AtomicUsize,
    pub peak: AtomicUsize,
    pub uploads: Mutex<Vec<(String, String)>>,
}

impl Ledger {
    pub fn connect_attempts(&self, host: &str) -> usize {
        self.connects.lock().unwrap().iter().filter(|h| *h == host).count()
    }
}

/// A connector over scripted hosts. Hosts without a script behave like
/// [`HostScript::default`].
#[derive(Debug, Clone)]
pub struct FakeConnector {
    user: String,
    scripts: HashMap<String, HostScript>,
    pub ledger: Arc<Ledger>,
}

impl FakeConnector {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            scripts: HashMap::new(),
            ledger: Arc::new(Ledger::default()),
        }
    }

    pub fn host(mut self, host: &str, script: HostScript) -> Self {
        self.scripts.insert(host.to_string(), script);
        self
    }
}

impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self, host: &HostAddr) -> Result<FakeSession> {
        self.ledger
            .connects
            .lock()
            .unwrap()
            .push(host.identity().to_string());
        let script = self.scripts.get(host.identity()).cloned().unwrap_or_default();
        tokio::time::sleep(script.latency).await;
        if !script.reachable {
            return Err(SshError::connection(
                host.hostname(),
                host.port(),
                "Connection refused (os error 111)",
            ));
        }
        Ok(FakeSession {
            host: host.identity().to_string(),
            user: self.user.clone(),
            script,
            ledger: Arc::clone(&self.ledger),
            open: true,
        })
    }
}

/// Session to a scripted host.
#[derive(Debug)]
pub struct FakeSession {
    host: String,
    user: String,
    script: HostScript,
    ledger: Arc<Ledger>,
    open: bool,
}

impl FakeSession {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(SshError::NotConnected)
        }
    }

    fn upload(&self, local: &Path, remote: &str, options: PutOptions) -> Result<RemoteFile> {
        let meta = std::fs::metadata(local).map_err(|e| SshError::local_io(local, e))?;
        self.ledger
            .uploads
            .lock()
            .unwrap()
            .push((self.host.clone(), remote.to_string()));
        Ok(RemoteFile {
            path: remote.to_string(),
            size: meta.len(),
            mode: options.mode.unwrap_or(0o644),
        })
    }
}

impl RemoteSession for FakeSession {
    async fn run(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
        _quote: bool,
    ) -> Result<CommandResult> {
        self.ensure_open()?;
        let now = self.ledger.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.ledger.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.script.latency).await;
        self.ledger.running.fetch_sub(1, Ordering::SeqCst);

        match &self.script.reply {
            Reply::User => Ok(CommandResult::new(format!("{}\n", self.user), "", 0)),
            Reply::Output {
                stdout,
                stderr,
                code,
            } => Ok(CommandResult::new(stdout.clone(), stderr.clone(), *code)),
            Reply::Hang { partial } => {
                let Some(timeout) = timeout else {
                    return std::future::pending().await;
                };
                tokio::time::sleep(timeout).await;
                Err(SshError::CommandTimeout {
                    command: sanitize_command(command).into_owned(),
                    timeout,
                    connect_timeout: Duration::from_secs(10),
                    stdout: partial.clone(),
                    stderr: String::new(),
                })
            }
            Reply::Broken(reason) => Err(SshError::protocol(reason)),
        }
    }

    async fn put(&mut self, local: &Path, remote: &str, options: PutOptions) -> Result<RemoteFile> {
        self.ensure_open()?;
        self.upload(local, remote, options)
    }

    async fn put_dir(
        &mut self,
        local: &Path,
        remote: &str,
        options: PutOptions,
    ) -> Result<Vec<RemoteFile>> {
        self.ensure_open()?;
        let base = local.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(local).sort_by_file_name() {
            let entry = entry.map_err(|e| SshError::protocol(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(local)
                .map_err(|e| SshError::protocol(e.to_string()))?;
            let target = format!("{remote}/{base}/{}", relative.to_string_lossy());
            files.push(self.upload(entry.path(), &target, options)?);
        }
        Ok(files)
    }

    async fn mkdir(&mut self, _path: &str) -> Result<()> {
        self.ensure_open()
    }

    async fn delete_file(&mut self, path: &str) -> Result<()> {
        self.ensure_open()?;
        if path.ends_with("missing") {
            return Err(SshError::NotFound {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_dir(
        &mut self,
        path: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<DirRemoval> {
        self.ensure_open()?;
        if force {
            let command = format!("rm -rf {path}");
            return self.run(&command, timeout, false).await.map(DirRemoval::Command);
        }
        Ok(DirRemoval::Removed)
    }

    async fn exists(&mut self, path: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(!path.ends_with("missing"))
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.ledger.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

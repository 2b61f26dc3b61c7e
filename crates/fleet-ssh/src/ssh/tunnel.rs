//! Transport streams the SSH handshake runs over.
//!
//! A target is reached with a plain TCP socket, through a `direct-tcpip`
//! channel opened on an already authenticated bastion session, or over the
//! stdio of a local proxy command. Each yields a duplex byte stream, and
//! [`handshake`] does not care which one it gets.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use russh::client;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::handler::ClientHandler;
use crate::error::{Result, SshError};

/// Opens the byte stream a session handshake runs over.
pub trait StreamFactory: Send {
    /// Duplex stream produced.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a stream to `host:port`.
    fn open(&mut self, host: &str, port: u16) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// Plain TCP connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectTcp;

impl StreamFactory for DirectTcp {
    type Stream = TcpStream;

    async fn open(&mut self, host: &str, port: u16) -> Result<TcpStream> {
        tracing::debug!(host = %host, port = port, "Opening TCP connection");
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| SshError::connection(host, port, e))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

/// `direct-tcpip` channel relayed by a bastion session.
pub struct BastionRelay<'a> {
    handle: &'a client::Handle<ClientHandler>,
    bastion: String,
}

impl<'a> BastionRelay<'a> {
    /// Relay through an authenticated bastion session.
    pub fn new(handle: &'a client::Handle<ClientHandler>, bastion: impl Into<String>) -> Self {
        Self {
            handle,
            bastion: bastion.into(),
        }
    }
}

impl std::fmt::Debug for BastionRelay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BastionRelay")
            .field("bastion", &self.bastion)
            .finish_non_exhaustive()
    }
}

impl StreamFactory for BastionRelay<'_> {
    type Stream = russh::ChannelStream<client::Msg>;

    async fn open(&mut self, host: &str, port: u16) -> Result<Self::Stream> {
        tracing::debug!(
            host = %host,
            port = port,
            bastion = %self.bastion,
            "Opening direct-tcpip channel through bastion"
        );
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "", 0)
            .await
            .map_err(|e| SshError::Bastion {
                bastion: self.bastion.clone(),
                source: Box::new(SshError::connection(host, port, e)),
            })?;
        Ok(channel.into_stream())
    }
}

/// Local command whose stdin and stdout carry the connection, like the
/// OpenSSH `ProxyCommand` option.
///
/// The command runs under the platform shell and is killed when the stream
/// is dropped. Its stderr is discarded.
#[derive(Debug, Clone)]
pub struct ProxyCommand {
    template: String,
    user: String,
}

impl ProxyCommand {
    /// A proxy command for logins as `user`.
    pub fn new(template: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            user: user.into(),
        }
    }

    /// Command line for `host:port`: `%h`, `%p`, `%r` and `%%` are expanded,
    /// other `%` sequences are kept as written.
    #[must_use]
    pub fn expand(&self, host: &str, port: u16) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut chars = self.template.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('h') => out.push_str(host),
                Some('p') => out.push_str(&port.to_string()),
                Some('r') => out.push_str(&self.user),
                Some('%') => out.push('%'),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

impl StreamFactory for ProxyCommand {
    type Stream = ProxyStream;

    async fn open(&mut self, host: &str, port: u16) -> Result<ProxyStream> {
        let command = self.expand(host, port);
        tracing::debug!(host = %host, port = port, command = %command, "Starting proxy command");
        let mut child = shell(&command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SshError::connection(host, port, format!("proxy command failed to start: {e}")))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SshError::connection(host, port, "proxy command has no stdio"));
        };
        Ok(ProxyStream {
            child,
            stdin,
            stdout,
        })
    }
}

/// Byte stream over a proxy command's stdout (read) and stdin (write).
#[derive(Debug)]
pub struct ProxyStream {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ProxyStream {
    /// OS process id of the proxy command, while it runs.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

/// Open a stream with `factory` and run the SSH handshake over it.
///
/// `rejected` is the flag handed out by [`ClientHandler::new`]; when it is
/// raised the failure is reported as a host key error.
pub async fn handshake<F: StreamFactory>(
    factory: &mut F,
    host: &str,
    port: u16,
    handler: ClientHandler,
    rejected: &Arc<AtomicBool>,
) -> Result<client::Handle<ClientHandler>> {
    let stream = factory.open(host, port).await?;
    let config = Arc::new(client::Config::default());
    client::connect_stream(config, stream, handler)
        .await
        .map_err(|e| {
            if rejected.load(Ordering::SeqCst) {
                SshError::HostKey {
                    host: host.to_string(),
                }
            } else {
                SshError::connection(host, port, e)
            }
        })
}

//! SSH transport built on russh.
//!
//! [`SshSession`] is the single-host session; [`SshConnector`] opens sessions
//! for a fleet. The submodules hold the pieces a session is made of: host key
//! checks, stream factories for direct, bastion and proxy command connections, the command
//! poll loop and SFTP helpers.

pub mod exec;
pub mod handler;
pub mod session;
pub mod sftp;
pub mod tunnel;

pub use handler::{ClientHandler, KnownHostStatus};
pub use session::{SshConnector, SshSession};
pub use tunnel::{BastionRelay, DirectTcp, ProxyCommand, ProxyStream, StreamFactory};

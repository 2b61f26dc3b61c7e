//! fleet-ssh: run commands and move files across many hosts over SSH
//!
//! This crate opens one SSH session per host and fans every operation out to
//! all of them concurrently, collecting a per-host result map.
//!
//! # Features
//!
//! - **Async sessions** on Tokio and russh, with SFTP uploads
//! - **Bastion hosts** via `direct-tcpip` channels
//! - **Bounded concurrency** with quarantine of unreachable hosts
//! - **Secret masking** in error reports and logs
//! - **Subscriber setup** for binaries (feature: `tracing-init`)
//!
//! # Example
//!
//! ```ignore
//! use fleet_ssh::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), FleetError> {
//!     let fleet = FleetCoordinator::builder(["web1", "web2:2222"])
//!         .username("deploy")
//!         .open()
//!         .await?;
//!     for (host, outcome) in fleet.run("uptime", None, false).await {
//!         println!("{host}: {outcome:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod host;
pub mod keys;
pub mod output;
pub mod prelude;
pub mod redact;
pub mod remote;
pub mod result;

pub mod fleet;
pub mod ssh;

/// Subscriber installation.
#[cfg(feature = "tracing-init")]
pub mod telemetry;

pub use auth::{AuthMethod, Credentials, HostKeyVerification};
pub use config::{FleetSettings, SessionConfig};
pub use error::{FleetError, FleetResult, KeyError, Result, SshError};
pub use fleet::{FleetBuilder, FleetCoordinator, parallel_concurrency};
pub use host::{HostAddr, parse_host_list, parse_hosts};
pub use keys::{KeyKind, LoadedKey, is_private_key_material};
pub use output::LineHandler;
pub use redact::sanitize_command;
pub use remote::{Connector, PutOptions, RemoteSession};
pub use result::{
    CommandResult, ConnectResult, DirRemoval, ErrorResult, ExecutionStatus, FleetResults,
    HostOutcome, Outcome, RemoteFile, overall_status,
};
pub use ssh::{SshConnector, SshSession};

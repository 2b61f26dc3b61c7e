//! Convenient imports.
//!
//! ```ignore
//! use fleet_ssh::prelude::*;
//! ```

pub use crate::auth::{Credentials, HostKeyVerification};
pub use crate::config::{FleetSettings, SessionConfig};
pub use crate::error::{FleetError, FleetResult, SshError};
pub use crate::fleet::{FleetBuilder, FleetCoordinator};
pub use crate::host::HostAddr;
pub use crate::remote::{Connector, PutOptions, RemoteSession};
pub use crate::result::{
    CommandResult, DirRemoval, ErrorResult, FleetResults, HostOutcome, RemoteFile,
};
pub use crate::ssh::{SshConnector, SshSession};

//! Credentials, host key policy and the authentication plan.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::env::home_dir;
use crate::error::{FleetError, FleetResult, KeyError};
use crate::keys::{self, LoadedKey};

/// Key files tried when no explicit credential is given, in order.
pub const DEFAULT_IDENTITY_FILES: [&str; 4] = ["id_ed25519", "id_ecdsa", "id_rsa", "id_dsa"];

/// Credentials shared by every host of a fleet.
#[derive(Clone, Default)]
pub enum Credentials {
    /// Password authentication.
    Password(String),
    /// One or more private key files.
    KeyFiles {
        /// Key file paths, tried in order.
        paths: Vec<PathBuf>,
        /// Passphrase for encrypted keys.
        passphrase: Option<String>,
    },
    /// Private key data held in memory.
    KeyMaterial {
        /// PEM or OpenSSH armored key.
        material: String,
        /// Passphrase for an encrypted key.
        passphrase: Option<String>,
    },
    /// SSH agent plus the default identity files in `~/.ssh`.
    #[default]
    Default,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::KeyFiles { paths, passphrase } => f
                .debug_struct("KeyFiles")
                .field("paths", paths)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::KeyMaterial { passphrase, .. } => f
                .debug_struct("KeyMaterial")
                .field("material", &"<redacted>")
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::Default => f.write_str("Default"),
        }
    }
}

impl Credentials {
    /// Password credentials.
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password(password.into())
    }

    /// A single key file.
    pub fn key_file(path: impl Into<PathBuf>) -> Self {
        Self::KeyFiles {
            paths: vec![path.into()],
            passphrase: None,
        }
    }

    /// Several key files, tried in order.
    pub fn key_files<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self::KeyFiles {
            paths: paths.into_iter().map(Into::into).collect(),
            passphrase: None,
        }
    }

    /// In-memory key material.
    pub fn key_material(material: impl Into<String>) -> Self {
        Self::KeyMaterial {
            material: material.into(),
            passphrase: None,
        }
    }

    /// Interpret a runner style `private_key` parameter: key data when it
    /// carries a PEM header, otherwise a path to a key file.
    pub fn from_private_key_param(value: impl Into<String>) -> Self {
        let value = value.into();
        if keys::is_private_key_material(&value) {
            Self::key_material(value)
        } else {
            Self::key_file(value)
        }
    }

    /// Attach a passphrase. Only key based credentials accept one.
    pub fn with_passphrase(self, passphrase: impl Into<String>) -> FleetResult<Self> {
        let passphrase = Some(passphrase.into());
        match self {
            Self::KeyFiles { paths, .. } => Ok(Self::KeyFiles { paths, passphrase }),
            Self::KeyMaterial { material, .. } => Ok(Self::KeyMaterial {
                material,
                passphrase,
            }),
            Self::Password(_) | Self::Default => Err(FleetError::config(
                "passphrase should only be provided together with a private key",
            )),
        }
    }

    /// Short description for logs; never includes secrets.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::KeyFiles { .. } => "key_files",
            Self::KeyMaterial { .. } => "key_material",
            Self::Default => "agent+default_keys",
        }
    }

    /// Decode every key up front and produce the ordered method list.
    ///
    /// Explicit key files and key material must decode; a passphrase
    /// protected file with no passphrase fails here, before any connection
    /// is attempted. Default identity files that cannot be decoded are
    /// skipped.
    pub async fn auth_plan(&self) -> Result<Vec<AuthMethod>, KeyError> {
        match self {
            Self::Password(password) => Ok(vec![AuthMethod::Password(password.clone())]),
            Self::KeyFiles { paths, passphrase } => {
                let mut methods = Vec::with_capacity(paths.len());
                for path in paths {
                    let path = expand_tilde(path);
                    let key = keys::load_key_file(&path, passphrase.as_deref()).await?;
                    methods.push(AuthMethod::PublicKey(key));
                }
                Ok(methods)
            }
            Self::KeyMaterial {
                material,
                passphrase,
            } => {
                let key = keys::decode_key_material(material, passphrase.as_deref())?;
                Ok(vec![AuthMethod::PublicKey(key)])
            }
            Self::Default => {
                let mut methods = vec![AuthMethod::Agent];
                methods.extend(discover_default_keys().await);
                Ok(methods)
            }
        }
    }
}

async fn discover_default_keys() -> Vec<AuthMethod> {
    let Some(ssh_dir) = home_dir().map(|h| h.join(".ssh")) else {
        return Vec::new();
    };
    let mut methods = Vec::new();
    for name in DEFAULT_IDENTITY_FILES {
        let path = ssh_dir.join(name);
        if !path.is_file() {
            continue;
        }
        match keys::load_key_file(&path, None).await {
            Ok(key) => methods.push(AuthMethod::PublicKey(key)),
            Err(e) => {
                tracing::debug!(key = %path.display(), error = %e, "Skipping default key");
            }
        }
    }
    methods
}

/// Expand a leading `~/` to the home directory.
#[must_use]
pub fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// One authentication attempt.
#[derive(Clone)]
pub enum AuthMethod {
    /// Password authentication.
    Password(String),
    /// A decoded private key.
    PublicKey(LoadedKey),
    /// Keys offered by the running SSH agent.
    Agent,
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::PublicKey(key) => f.debug_tuple("PublicKey").field(key).finish(),
            Self::Agent => f.write_str("Agent"),
        }
    }
}

impl AuthMethod {
    /// Name of the method for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PublicKey(_) => "publickey",
            Self::Agent => "agent",
        }
    }
}

/// How server host keys are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyVerification {
    /// Only hosts already in `known_hosts` with a matching key are accepted.
    KnownHosts,
    /// Known hosts must match; unknown hosts are accepted without being saved.
    #[default]
    AcceptNew,
    /// Unknown hosts are accepted and appended to `known_hosts`.
    Tofu,
}

impl FromStr for HostKeyVerification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "known-hosts" | "known_hosts" | "strict" => Ok(Self::KnownHosts),
            "accept-new" | "accept_new" | "accept" => Ok(Self::AcceptNew),
            "tofu" => Ok(Self::Tofu),
            _ => Err(format!("Unknown host key verification mode: {s}")),
        }
    }
}

//! Private key loading and classification.
//!
//! Keys are decoded before any network activity so that a passphrase
//! protected key with no passphrase, a wrong passphrase, and garbage data all
//! fail fast with distinct errors instead of surfacing later as an ambiguous
//! authentication failure.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use russh::keys::{Algorithm, PrivateKey};

use crate::error::KeyError;

/// Supported private key families.
///
/// Detection walks [`KeyKind::ALL`] and the first kind that accepts the key
/// wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// RSA keys.
    Rsa,
    /// ECDSA keys on the NIST curves.
    Ecdsa,
    /// Ed25519 keys.
    Ed25519,
    /// Legacy DSA keys.
    Dsa,
}

impl KeyKind {
    /// Every kind, highest priority first.
    pub const ALL: [Self; 4] = [Self::Rsa, Self::Ecdsa, Self::Ed25519, Self::Dsa];

    /// Legacy PEM armor label of this family. Ed25519 keys only come in the
    /// OpenSSH container.
    #[must_use]
    pub const fn legacy_pem_label(self) -> Option<&'static str> {
        match self {
            Self::Rsa => Some("RSA PRIVATE KEY"),
            Self::Ecdsa => Some("EC PRIVATE KEY"),
            Self::Ed25519 => None,
            Self::Dsa => Some("DSA PRIVATE KEY"),
        }
    }

    /// Whether a decoded key of `algorithm` belongs to this family.
    #[must_use]
    pub const fn accepts(self, algorithm: &Algorithm) -> bool {
        matches!(
            (self, algorithm),
            (Self::Rsa, Algorithm::Rsa { .. })
                | (Self::Ecdsa, Algorithm::Ecdsa { .. })
                | (Self::Ed25519, Algorithm::Ed25519)
                | (Self::Dsa, Algorithm::Dsa)
        )
    }

    /// Kind implied by a legacy PEM label, if the label names one.
    #[must_use]
    pub fn from_pem_label(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.legacy_pem_label() == Some(label))
    }

    /// First kind, in priority order, that accepts `algorithm`.
    #[must_use]
    pub fn from_algorithm(algorithm: &Algorithm) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.accepts(algorithm))
    }

    /// SSH name of the key family.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rsa => "ssh-rsa",
            Self::Ecdsa => "ecdsa",
            Self::Ed25519 => "ssh-ed25519",
            Self::Dsa => "ssh-dss",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded private key and its family.
#[derive(Clone)]
pub struct LoadedKey {
    /// Key family.
    pub kind: KeyKind,
    /// The decoded key.
    pub key: Arc<PrivateKey>,
    /// Where the key came from, for logs and errors.
    pub origin: String,
}

impl fmt::Debug for LoadedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedKey")
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Check whether a string holds private key data rather than a path.
#[must_use]
pub fn is_private_key_material(value: &str) -> bool {
    let value = value.trim_start();
    value.starts_with("-----BEGIN ") && value.contains("PRIVATE KEY-----")
}

/// Label of the first PEM armor line, e.g. `RSA PRIVATE KEY`.
fn pem_label(material: &str) -> Option<&str> {
    let line = material.trim_start().lines().next()?;
    line.strip_prefix("-----BEGIN ")?.strip_suffix("-----")
}

/// Decode key material held in memory.
pub fn decode_key_material(
    material: &str,
    passphrase: Option<&str>,
) -> Result<LoadedKey, KeyError> {
    if !is_private_key_material(material) && (material.contains('/') || material.contains('\\'))
    {
        return Err(KeyError::LooksLikePath);
    }
    decode(material, passphrase, "key material")
}

/// Read and decode a key file.
///
/// A passphrase protected file with no passphrase fails with
/// [`KeyError::PassphraseRequired`] before anything touches the network.
pub async fn load_key_file(path: &Path, passphrase: Option<&str>) -> Result<LoadedKey, KeyError> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| KeyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    decode(&data, passphrase, &path.display().to_string())
}

fn decode(material: &str, passphrase: Option<&str>, origin: &str) -> Result<LoadedKey, KeyError> {
    let hinted = pem_label(material).and_then(KeyKind::from_pem_label);
    let passphrase = passphrase.filter(|p| !p.is_empty());

    let key = russh::keys::decode_secret_key(material, passphrase)
        .map_err(|e| classify_decode_error(material, passphrase, origin, &e))?;

    let kind = KeyKind::from_algorithm(&key.algorithm())
        .or(hinted)
        .ok_or_else(|| KeyError::UnsupportedType {
            kind: key.algorithm().as_str().to_string(),
        })?;

    tracing::debug!(origin = %origin, kind = %kind, "Decoded private key");

    Ok(LoadedKey {
        kind,
        key: Arc::new(key),
        origin: origin.to_string(),
    })
}

fn classify_decode_error(
    material: &str,
    passphrase: Option<&str>,
    origin: &str,
    err: &russh::keys::Error,
) -> KeyError {
    let encrypted = is_encrypted_error(err) || looks_encrypted(material);

    match (passphrase, encrypted) {
        (None, true) => KeyError::PassphraseRequired {
            source_name: origin.to_string(),
        },
        (Some(_), true) => KeyError::WrongPassphrase,
        _ if err.to_string().to_lowercase().contains("unsupported") => {
            KeyError::UnsupportedType {
                kind: err.to_string(),
            }
        }
        _ => match pem_label(material).and_then(KeyKind::from_pem_label) {
            // The armor names a family the decoder could not handle.
            Some(kind) if is_private_key_material(material) => KeyError::UnsupportedType {
                kind: kind.to_string(),
            },
            _ => KeyError::Corrupt {
                reason: err.to_string(),
            },
        },
    }
}

fn is_encrypted_error(err: &russh::keys::Error) -> bool {
    matches!(err, russh::keys::Error::KeyIsEncrypted)
        || err.to_string().to_lowercase().contains("encrypted")
}

/// Encryption markers of the PEM and PKCS#8 containers.
fn looks_encrypted(material: &str) -> bool {
    material.contains("Proc-Type: 4,ENCRYPTED")
        || pem_label(material) == Some("ENCRYPTED PRIVATE KEY")
}

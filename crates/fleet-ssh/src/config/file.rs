//! File-based configuration loading.

use std::path::Path;

use super::FleetSettings;
use crate::error::{FleetError, FleetResult};

/// Configuration file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML format.
    Toml,
    /// JSON format.
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension.
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Detect format from path. Files without a known extension are TOML.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
            .unwrap_or(Self::Toml)
    }
}

impl FleetSettings {
    /// Read settings from a TOML or JSON file. Missing keys keep defaults.
    pub fn from_file(path: &Path) -> FleetResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            FleetError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&text, ConfigFormat::from_path(path))
            .map_err(|e| FleetError::config(format!("{}: {e}", path.display())))
    }

    /// Parse settings text in the given format.
    pub fn parse(text: &str, format: ConfigFormat) -> Result<Self, String> {
        let settings: Self = match format {
            ConfigFormat::Toml => toml::from_str(text).map_err(|e| e.to_string())?,
            ConfigFormat::Json => serde_json::from_str(text).map_err(|e| e.to_string())?,
        };
        if settings.max_parallel_actions == 0 {
            return Err("max_parallel_actions must be at least 1".to_string());
        }
        Ok(settings)
    }
}

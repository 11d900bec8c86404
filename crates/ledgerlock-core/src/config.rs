//! Persisted vault record (`vault.json`).

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::kdf::{KdfParams, MIN_SALT_LEN};

pub const CURRENT_CONFIG_VERSION: u32 = 1;
pub const MIN_LOCK_TIMEOUT_MINUTES: u32 = 1;
pub const MAX_LOCK_TIMEOUT_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    #[serde(default)]
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub kdf_params: KdfParams,
    pub wrapped_dek: String,
    #[serde(default)]
    pub device_key_enabled: bool,
    #[serde(default = "current_tax_year")]
    pub default_tax_year: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_timeout_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_key_hash: Option<String>,
}

fn current_tax_year() -> i32 {
    Utc::now().year()
}

impl VaultConfig {
    /// Structural checks that do not need any key material.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version > CURRENT_CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
                supported: CURRENT_CONFIG_VERSION,
            });
        }
        if self.kdf_params.salt().len() < MIN_SALT_LEN {
            return Err(ConfigError::Invalid(format!(
                "salt must be at least {MIN_SALT_LEN} bytes"
            )));
        }
        if self.wrapped_dek.trim().is_empty() {
            return Err(ConfigError::Invalid("wrapped DEK is empty".into()));
        }
        if !self.device_key_enabled && self.recovery_key_hash.is_some() {
            return Err(ConfigError::Invalid(
                "recovery key hash present on a password-only vault".into(),
            ));
        }
        if let Some(minutes) = self.lock_timeout_minutes {
            if !(MIN_LOCK_TIMEOUT_MINUTES..=MAX_LOCK_TIMEOUT_MINUTES).contains(&minutes) {
                return Err(ConfigError::Invalid(format!(
                    "lock timeout {minutes} outside {MIN_LOCK_TIMEOUT_MINUTES}..={MAX_LOCK_TIMEOUT_MINUTES} minutes"
                )));
            }
        }
        Ok(())
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: VaultConfig = serde_json::from_str(raw)?;
        migrate_config(&mut config)?;
        config.validate()?;
        Ok(config)
    }
}

fn migrate_config(config: &mut VaultConfig) -> Result<(), ConfigError> {
    if config.version > CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion {
            found: config.version,
            supported: CURRENT_CONFIG_VERSION,
        });
    }
    if config.version < 1 {
        // pre-versioned records carried a hash even when the device key was off
        if !config.device_key_enabled {
            config.recovery_key_hash = None;
        }
        config.version = 1;
        debug!("migrated vault record to version 1");
    }
    Ok(())
}

/// File-backed home of the single [`VaultConfig`].
#[derive(Debug, Clone)]
pub struct VaultConfigStore {
    path: PathBuf,
}

impl VaultConfigStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<Option<VaultConfig>, ConfigError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        VaultConfig::from_json(&raw).map(Some)
    }

    /// Replace the record atomically: write a sibling temp file, fsync, rename.
    pub fn save(&self, config: &VaultConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;
        let mut staged = tempfile::NamedTempFile::new_in(&parent)?;
        let json = serde_json::to_vec_pretty(config)?;
        staged.write_all(&json)?;
        staged.as_file().sync_all()?;
        staged
            .persist(&self.path)
            .map_err(|e| ConfigError::Io(e.error))?;
        info!(path = %self.path.display(), "vault record written");
        Ok(())
    }
}

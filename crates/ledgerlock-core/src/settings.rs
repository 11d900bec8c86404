use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::kdf::KdfCost;
use crate::paths;
use crate::session::DEFAULT_ABSOLUTE_LIFETIME_MS;

pub const DISABLE_KEYRING_ENV: &str = "LEDGERLOCK_DISABLE_KEYRING";
pub const DEFAULT_IDLE_TIMEOUT_MINUTES: u32 = 15;
pub const DEFAULT_AUDIT_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// Missing fields take their value from [`VaultSettings::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VaultSettings {
    /// `None` resolves to the per-user data directory.
    pub data_dir: Option<PathBuf>,
    pub use_device_key: bool,
    pub default_idle_timeout_minutes: u32,
    pub absolute_session_lifetime_ms: u64,
    pub kdf: KdfCost,
    pub audit_log_max_bytes: u64,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            use_device_key: true,
            default_idle_timeout_minutes: DEFAULT_IDLE_TIMEOUT_MINUTES,
            absolute_session_lifetime_ms: DEFAULT_ABSOLUTE_LIFETIME_MS,
            kdf: KdfCost::default(),
            audit_log_max_bytes: DEFAULT_AUDIT_LOG_MAX_BYTES,
        }
    }
}

impl VaultSettings {
    /// Read settings from `path` (defaults when the file is absent), then
    /// apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read settings {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parse settings {}", path.display()))?
        } else {
            Self::default()
        };
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_idle_timeout_minutes == 0 {
            bail!("default_idle_timeout_minutes must be at least 1");
        }
        if self.absolute_session_lifetime_ms == 0 {
            bail!("absolute_session_lifetime_ms must be positive");
        }
        Ok(())
    }

    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(paths::DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.data_dir = Some(PathBuf::from(dir));
            }
        }
        if matches!(
            std::env::var(DISABLE_KEYRING_ENV).as_deref(),
            Ok("1") | Ok("true")
        ) {
            self.use_device_key = false;
        }
    }

    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::data_dir(),
        }
    }

    pub fn default_idle_timeout_ms(&self) -> u64 {
        u64::from(self.default_idle_timeout_minutes) * 60_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults() {
        let settings = VaultSettings::default();
        assert!(settings.use_device_key);
        assert_eq!(settings.default_idle_timeout_ms(), 15 * 60 * 1000);
        assert_eq!(settings.absolute_session_lifetime_ms, 24 * 60 * 60 * 1000);
        assert!(!settings.kdf.is_below_recommended());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"default_idle_timeout_minutes": 5}"#).unwrap();
        let settings = VaultSettings::load(&path).unwrap();
        assert_eq!(settings.default_idle_timeout_minutes, 5);
        assert_eq!(settings.kdf, KdfCost::default());
        assert_eq!(settings.audit_log_max_bytes, DEFAULT_AUDIT_LOG_MAX_BYTES);
        assert_eq!(
            settings.absolute_session_lifetime_ms,
            DEFAULT_ABSOLUTE_LIFETIME_MS
        );
    }

    #[test]
    fn empty_object_is_all_defaults() {
        let settings: VaultSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, VaultSettings::default());
    }

    #[test]
    fn zero_idle_timeout_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"default_idle_timeout_minutes": 0}"#).unwrap();
        let err = VaultSettings::load(&path).unwrap_err();
        assert!(err.to_string().contains("default_idle_timeout_minutes"));
    }

    #[test]
    fn explicit_data_dir_wins() {
        let settings = VaultSettings {
            data_dir: Some(PathBuf::from("/tmp/ledgerlock-test")),
            ..VaultSettings::default()
        };
        assert_eq!(
            settings.resolve_data_dir().unwrap(),
            PathBuf::from("/tmp/ledgerlock-test")
        );
    }
}

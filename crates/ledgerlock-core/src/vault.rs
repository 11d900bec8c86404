//! Vault orchestrator: `Unconfigured → Configuring → Locked ⇄ Unlocked`.
//!
//! Operations that derive keys are serialised on one async mutex and run the
//! KDF on the blocking pool, so concurrent unlocks cannot race on the rate
//! limiter or the session table. Every intermediate key (KEK, device key,
//! wrapping key) lives in a `Zeroizing` buffer and is wiped on every return
//! path. Credential failures collapse to [`VaultError::IncorrectCredentials`]
//! at this boundary; only a missing device key is reported distinctly.

use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditSink, JsonlAuditLog, NullAuditSink, SecurityEvent};
use crate::cipher::{self, KeyBytes};
use crate::config::{
    VaultConfig, VaultConfigStore, CURRENT_CONFIG_VERSION, MAX_LOCK_TIMEOUT_MINUTES,
    MIN_LOCK_TIMEOUT_MINUTES,
};
use crate::device_key::{
    self, DeviceKeyLookup, DeviceKeyStore, KeyringDeviceKeyStore, UnavailableDeviceKeyStore,
};
use crate::error::{CryptoError, VaultError, VaultResult};
use crate::kdf::{self, KdfAlgorithm, KdfCost, KdfParams};
use crate::paths;
use crate::rate_limit::UnlockRateLimiter;
use crate::recovery::{self, RecoveryKey};
use crate::session::{SessionManager, SessionToken};
use crate::settings::{VaultSettings, DEFAULT_IDLE_TIMEOUT_MINUTES};

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultState {
    Unconfigured,
    Configuring,
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    /// Defaults to the current calendar year.
    pub default_tax_year: Option<i32>,
    pub lock_timeout_minutes: Option<u32>,
}

#[derive(Debug)]
pub struct SetupOutcome {
    pub token: SessionToken,
    /// Present only when the vault is bound to a device key. Never retrievable again.
    pub recovery_key: Option<RecoveryKey>,
    pub device_key_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultStatus {
    pub state: VaultState,
    pub device_key_enabled: Option<bool>,
    pub lock_timeout_minutes: Option<u32>,
    pub kdf_algorithm: Option<KdfAlgorithm>,
    pub failed_attempts: u32,
    pub lockout_count: u32,
    pub locked_out_secs: Option<u64>,
}

fn minutes_to_ms(minutes: u32) -> u64 {
    u64::from(minutes) * 60_000
}

fn check_password_policy(password: &str) -> VaultResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(VaultError::PasswordTooShort {
            min: MIN_PASSWORD_LEN,
        });
    }
    Ok(())
}

fn check_lock_timeout(minutes: u32) -> VaultResult<()> {
    if !(MIN_LOCK_TIMEOUT_MINUTES..=MAX_LOCK_TIMEOUT_MINUTES).contains(&minutes) {
        return Err(VaultError::InvalidLockTimeout {
            min: MIN_LOCK_TIMEOUT_MINUTES,
            max: MAX_LOCK_TIMEOUT_MINUTES,
        });
    }
    Ok(())
}

/// KEK alone, or KEK ⊕ device key.
fn wrapping_key(kek: KeyBytes, device_key: Option<&[u8]>) -> Result<KeyBytes, CryptoError> {
    match device_key {
        Some(dk) => device_key::combine(&kek[..], dk),
        None => Ok(kek),
    }
}

async fn derive_existing(password: &str, params: &KdfParams) -> VaultResult<KeyBytes> {
    let password = Zeroizing::new(password.to_owned());
    let params = params.clone();
    let kek = tokio::task::spawn_blocking(move || kdf::derive_key(&password, &params))
        .await
        .map_err(|e| VaultError::Internal(format!("key derivation task failed: {e}")))??;
    Ok(kek)
}

async fn derive_fresh(password: &str, cost: &KdfCost) -> VaultResult<(KdfParams, KeyBytes)> {
    let password = Zeroizing::new(password.to_owned());
    let cost = cost.clone();
    let derived = tokio::task::spawn_blocking(move || kdf::derive_new_key(&password, &cost))
        .await
        .map_err(|e| VaultError::Internal(format!("key derivation task failed: {e}")))??;
    Ok(derived)
}

/// Clears the `configuring` flag however setup exits.
struct ConfiguringGuard<'a>(&'a AtomicBool);

impl Drop for ConfiguringGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Vault {
    store: VaultConfigStore,
    device_keys: Arc<dyn DeviceKeyStore>,
    sessions: Arc<SessionManager>,
    limiter: Arc<UnlockRateLimiter>,
    audit: Arc<dyn AuditSink>,
    kdf_cost: KdfCost,
    use_device_key: bool,
    default_idle_timeout_ms: u64,
    configuring: AtomicBool,
    active: Mutex<Option<SessionToken>>,
    op_lock: tokio::sync::Mutex<()>,
}

pub struct VaultBuilder {
    config_path: PathBuf,
    device_keys: Option<Arc<dyn DeviceKeyStore>>,
    sessions: Option<Arc<SessionManager>>,
    limiter: Option<Arc<UnlockRateLimiter>>,
    audit: Option<Arc<dyn AuditSink>>,
    kdf_cost: KdfCost,
    use_device_key: bool,
    default_idle_timeout_ms: u64,
}

impl VaultBuilder {
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            device_keys: None,
            sessions: None,
            limiter: None,
            audit: None,
            kdf_cost: KdfCost::default(),
            use_device_key: true,
            default_idle_timeout_ms: minutes_to_ms(DEFAULT_IDLE_TIMEOUT_MINUTES),
        }
    }

    pub fn device_key_store(mut self, store: Arc<dyn DeviceKeyStore>) -> Self {
        self.device_keys = Some(store);
        self
    }

    pub fn sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<UnlockRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn kdf_cost(mut self, cost: KdfCost) -> Self {
        self.kdf_cost = cost;
        self
    }

    pub fn use_device_key(mut self, enabled: bool) -> Self {
        self.use_device_key = enabled;
        self
    }

    pub fn default_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.default_idle_timeout_ms = ms;
        self
    }

    /// Unset collaborators fall back to the OS keyring, the process-wide
    /// session table and rate limiter, and a null audit sink.
    pub fn build(self) -> Vault {
        if self.kdf_cost.is_below_recommended() {
            warn!("vault built with a KDF cost below the recommended profile");
        }
        Vault {
            store: VaultConfigStore::new(self.config_path),
            device_keys: self
                .device_keys
                .unwrap_or_else(|| Arc::new(KeyringDeviceKeyStore::default())),
            sessions: self.sessions.unwrap_or_else(SessionManager::global),
            limiter: self.limiter.unwrap_or_else(UnlockRateLimiter::global),
            audit: self.audit.unwrap_or_else(|| Arc::new(NullAuditSink)),
            kdf_cost: self.kdf_cost,
            use_device_key: self.use_device_key,
            default_idle_timeout_ms: self.default_idle_timeout_ms,
            configuring: AtomicBool::new(false),
            active: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }
}

impl Vault {
    pub fn builder<P: AsRef<Path>>(config_path: P) -> VaultBuilder {
        VaultBuilder::new(config_path)
    }

    /// Wire a vault from settings: record and audit log under the data
    /// directory, keyring-backed device key unless disabled.
    pub fn open(settings: &VaultSettings) -> anyhow::Result<Self> {
        let data_dir = settings.resolve_data_dir()?;
        std::fs::create_dir_all(&data_dir)?;
        let audit_path = paths::audit_log_path(&data_dir);
        let audit: Arc<dyn AuditSink> =
            match JsonlAuditLog::open(&audit_path, settings.audit_log_max_bytes) {
                Ok(log) => Arc::new(log),
                Err(e) => {
                    warn!(path = %audit_path.display(), error = %e, "audit log unavailable; events will not be recorded");
                    Arc::new(NullAuditSink)
                }
            };
        let device_keys: Arc<dyn DeviceKeyStore> = if settings.use_device_key {
            Arc::new(KeyringDeviceKeyStore::default())
        } else {
            Arc::new(UnavailableDeviceKeyStore)
        };
        let sessions = SessionManager::global();
        sessions.set_absolute_lifetime_ms(settings.absolute_session_lifetime_ms);
        Ok(Self::builder(paths::vault_config_path(&data_dir))
            .device_key_store(device_keys)
            .sessions(sessions)
            .audit_sink(audit)
            .kdf_cost(settings.kdf.clone())
            .use_device_key(settings.use_device_key)
            .default_idle_timeout_ms(settings.default_idle_timeout_ms())
            .build())
    }

    pub fn config_path(&self) -> &Path {
        self.store.path()
    }

    fn emit(&self, event: SecurityEvent, detail: serde_json::Value) {
        if let Err(e) = self.audit.record(event, detail) {
            warn!(event = %event, error = %e, "audit sink rejected event");
        }
    }

    fn load_config(&self) -> VaultResult<VaultConfig> {
        self.store.load()?.ok_or(VaultError::VaultNotConfigured)
    }

    fn idle_timeout_ms(&self, config: &VaultConfig) -> u64 {
        config
            .lock_timeout_minutes
            .map(minutes_to_ms)
            .unwrap_or(self.default_idle_timeout_ms)
    }

    /// Replace whatever session is active with a new one for `dek`.
    fn open_session(&self, dek: KeyBytes, idle_timeout_ms: u64) -> SessionToken {
        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            self.sessions.destroy(&previous);
        }
        let token = self.sessions.create(dek, idle_timeout_ms);
        *active = Some(token.clone());
        token
    }

    fn end_session(&self) -> bool {
        match self.active.lock().take() {
            Some(token) => self.sessions.destroy(&token),
            None => false,
        }
    }

    fn check_rate_limit(&self) -> VaultResult<()> {
        if let Err(e) = self.limiter.check() {
            self.emit(
                SecurityEvent::UnlockRateLimited,
                serde_json::json!({ "remainingSecs": e.lockout_remaining() }),
            );
            return Err(e);
        }
        Ok(())
    }

    fn record_failure(&self, event: SecurityEvent) {
        let lockout = self.limiter.record_failure();
        self.emit(
            event,
            serde_json::json!({
                "failedAttempts": self.limiter.status().failed_attempts,
                "lockoutSecs": lockout.map(|d| d.num_seconds()),
            }),
        );
    }

    pub fn state(&self) -> VaultState {
        if self.configuring.load(Ordering::SeqCst) {
            return VaultState::Configuring;
        }
        if !self.store.exists() {
            return VaultState::Unconfigured;
        }
        match self.active.lock().as_ref() {
            Some(token) if self.sessions.contains(token) => VaultState::Unlocked,
            _ => VaultState::Locked,
        }
    }

    pub fn status(&self) -> VaultResult<VaultStatus> {
        let state = self.state();
        let config = match state {
            VaultState::Unconfigured | VaultState::Configuring => None,
            VaultState::Locked | VaultState::Unlocked => self.store.load()?,
        };
        let limits = self.limiter.status();
        Ok(VaultStatus {
            state,
            device_key_enabled: config.as_ref().map(|c| c.device_key_enabled),
            lock_timeout_minutes: config.as_ref().and_then(|c| c.lock_timeout_minutes),
            kdf_algorithm: config.as_ref().map(|c| c.kdf_params.algorithm()),
            failed_attempts: limits.failed_attempts,
            lockout_count: limits.lockout_count,
            locked_out_secs: limits.locked_out_secs,
        })
    }

    /// First-run setup. Returns the recovery key exactly once.
    pub async fn setup(&self, password: &str, options: SetupOptions) -> VaultResult<SetupOutcome> {
        check_password_policy(password)?;
        if let Some(minutes) = options.lock_timeout_minutes {
            check_lock_timeout(minutes)?;
        }
        if self
            .configuring
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(VaultError::SetupInProgress);
        }
        let _configuring = ConfiguringGuard(&self.configuring);
        let _op = self.op_lock.lock().await;
        if self.store.exists() {
            return Err(VaultError::AlreadyConfigured);
        }

        let (kdf_params, kek) = derive_fresh(password, &self.kdf_cost).await?;
        let device_key = if self.use_device_key {
            self.device_keys.get_or_create()
        } else {
            None
        };
        let device_key_enabled = device_key.is_some();
        let wrapping = wrapping_key(kek, device_key.as_ref().map(|k| &k[..]))?;

        let dek = cipher::generate_key();
        let wrapped_dek = cipher::wrap_key(&dek, &wrapping[..])?;
        let recovery_key = device_key.as_ref().map(|k| RecoveryKey::from_device_key(k));
        let recovery_key_hash = device_key.as_ref().map(|k| recovery::recovery_hash(&k[..]));

        let config = VaultConfig {
            version: CURRENT_CONFIG_VERSION,
            created_at: Utc::now(),
            kdf_params,
            wrapped_dek,
            device_key_enabled,
            default_tax_year: options.default_tax_year.unwrap_or_else(|| Utc::now().year()),
            lock_timeout_minutes: options.lock_timeout_minutes,
            recovery_key_hash,
        };
        self.store.save(&config)?;

        let token = self.open_session(dek, self.idle_timeout_ms(&config));
        info!(
            device_key_enabled,
            algorithm = ?config.kdf_params.algorithm(),
            "vault configured"
        );
        self.emit(
            SecurityEvent::VaultSetup,
            serde_json::json!({
                "deviceKeyEnabled": device_key_enabled,
                "kdfAlgorithm": config.kdf_params.algorithm(),
            }),
        );
        Ok(SetupOutcome {
            token,
            recovery_key,
            device_key_enabled,
        })
    }

    pub async fn unlock(&self, password: &str) -> VaultResult<SessionToken> {
        let _op = self.op_lock.lock().await;
        let config = self.load_config()?;
        self.check_rate_limit()?;

        let kek = derive_existing(password, &config.kdf_params).await?;
        let device_key = if config.device_key_enabled {
            match self.device_keys.get() {
                DeviceKeyLookup::Found(key) => Some(key),
                lookup => {
                    warn!(?lookup, "device key missing for device-bound vault");
                    self.emit(SecurityEvent::DeviceKeyMissing, serde_json::json!({}));
                    return Err(VaultError::DeviceKeyMissing);
                }
            }
        } else {
            None
        };
        let wrapping = wrapping_key(kek, device_key.as_ref().map(|k| &k[..]))?;

        let dek = match cipher::unwrap_key(&config.wrapped_dek, &wrapping[..]) {
            Ok(dek) => dek,
            Err(_) => {
                self.record_failure(SecurityEvent::UnlockFailed);
                return Err(VaultError::IncorrectCredentials);
            }
        };

        self.limiter.reset();
        let token = self.open_session(dek, self.idle_timeout_ms(&config));
        info!(session = %token.fingerprint(), "vault unlocked");
        self.emit(SecurityEvent::UnlockSuccess, serde_json::json!({}));
        Ok(token)
    }

    /// Unlock with the password plus the saved recovery key, for when the
    /// platform store has lost the device key.
    pub async fn unlock_with_recovery_key(
        &self,
        password: &str,
        recovery_key: &str,
    ) -> VaultResult<SessionToken> {
        let _op = self.op_lock.lock().await;
        let config = self.load_config()?;
        self.check_rate_limit()?;
        if !config.device_key_enabled {
            return Err(VaultError::RecoveryUnavailable);
        }
        let stored_hash = config
            .recovery_key_hash
            .as_deref()
            .ok_or(VaultError::RecoveryUnavailable)?;
        let candidate = recovery::parse_recovery_key(recovery_key)?;
        if !recovery::verify_recovery_hash(&candidate[..], stored_hash) {
            self.record_failure(SecurityEvent::RecoveryKeyFailed);
            return Err(VaultError::IncorrectCredentials);
        }

        let kek = derive_existing(password, &config.kdf_params).await?;
        let wrapping = wrapping_key(kek, Some(&candidate[..]))?;
        let dek = match cipher::unwrap_key(&config.wrapped_dek, &wrapping[..]) {
            Ok(dek) => dek,
            Err(_) => {
                self.record_failure(SecurityEvent::RecoveryUnlockFailed);
                return Err(VaultError::IncorrectCredentials);
            }
        };

        self.limiter.reset();
        let token = self.open_session(dek, self.idle_timeout_ms(&config));
        info!(session = %token.fingerprint(), "vault unlocked with recovery key");
        self.emit(SecurityEvent::RecoveryUnlockSuccess, serde_json::json!({}));
        Ok(token)
    }

    /// Destroy the active session. Safe in any state; repeated calls are no-ops.
    pub fn lock(&self) {
        let had_session = self.end_session();
        if had_session {
            info!("vault locked");
        } else {
            debug!("lock requested with no active session");
        }
        self.emit(
            SecurityEvent::Lock,
            serde_json::json!({ "hadSession": had_session }),
        );
    }

    /// Re-wrap the live DEK under a key derived from `new_password`. The
    /// current password is verified first; application data is untouched.
    pub async fn change_password(
        &self,
        token: &SessionToken,
        current_password: &str,
        new_password: &str,
    ) -> VaultResult<()> {
        check_password_policy(new_password)?;
        let _op = self.op_lock.lock().await;
        let session = self.sessions.get(token).ok_or(VaultError::SessionExpired)?;
        let mut config = self.load_config()?;
        self.check_rate_limit()?;

        let device_key = if config.device_key_enabled {
            let Some(key) = self.device_keys.get().into_key() else {
                self.emit(SecurityEvent::DeviceKeyMissing, serde_json::json!({}));
                return Err(VaultError::DeviceKeyMissing);
            };
            Some(key)
        } else {
            None
        };

        let current_kek = derive_existing(current_password, &config.kdf_params).await?;
        let current_wrapping = wrapping_key(current_kek, device_key.as_ref().map(|k| &k[..]))?;
        let stored_dek = match cipher::unwrap_key(&config.wrapped_dek, &current_wrapping[..]) {
            Ok(dek) => dek,
            Err(_) => {
                self.record_failure(SecurityEvent::PasswordChangeFailed);
                return Err(VaultError::IncorrectCredentials);
            }
        };
        if !bool::from(stored_dek[..].ct_eq(&session.dek[..])) {
            // session belongs to a different vault record (restored underneath it)
            return Err(VaultError::CryptoFailure);
        }

        let (kdf_params, new_kek) = derive_fresh(new_password, &self.kdf_cost).await?;
        let new_wrapping = wrapping_key(new_kek, device_key.as_ref().map(|k| &k[..]))?;
        config.wrapped_dek = cipher::wrap_key(&session.dek, &new_wrapping[..])?;
        config.kdf_params = kdf_params;
        self.store.save(&config)?;

        self.limiter.reset();
        info!(algorithm = ?config.kdf_params.algorithm(), "vault password changed");
        self.emit(
            SecurityEvent::PasswordChanged,
            serde_json::json!({ "kdfAlgorithm": config.kdf_params.algorithm() }),
        );
        Ok(())
    }

    /// Persist a new idle timeout and apply it to the live session.
    pub async fn set_lock_timeout(&self, token: &SessionToken, minutes: u32) -> VaultResult<()> {
        check_lock_timeout(minutes)?;
        let _op = self.op_lock.lock().await;
        if !self.sessions.contains(token) {
            return Err(VaultError::SessionExpired);
        }
        let mut config = self.load_config()?;
        config.lock_timeout_minutes = Some(minutes);
        self.store.save(&config)?;
        if !self.sessions.update_idle_timeout(token, minutes_to_ms(minutes)) {
            return Err(VaultError::SessionExpired);
        }
        self.emit(
            SecurityEvent::LockTimeoutChanged,
            serde_json::json!({ "minutes": minutes }),
        );
        Ok(())
    }

    /// DEK of the active session, for the record layer. Each call returns a
    /// fresh copy and slides the idle window.
    pub fn require_dek(&self) -> VaultResult<KeyBytes> {
        let mut active = self.active.lock();
        let Some(token) = active.as_ref() else {
            return Err(VaultError::VaultLocked);
        };
        match self.sessions.get(token) {
            Some(session) => Ok(session.dek),
            None => {
                *active = None;
                Err(VaultError::SessionExpired)
            }
        }
    }

    /// DEK for a caller-presented token (e.g. from a cookie).
    pub fn dek_for(&self, token: &SessionToken) -> VaultResult<KeyBytes> {
        self.sessions
            .get(token)
            .map(|session| session.dek)
            .ok_or(VaultError::SessionExpired)
    }

    /// Swap in a whole vault record (restore from backup). Every session
    /// holds a DEK of the old record, so all of them are destroyed first.
    pub async fn replace_config(&self, config: VaultConfig) -> VaultResult<()> {
        config.validate()?;
        let _op = self.op_lock.lock().await;
        self.active.lock().take();
        let destroyed = self.sessions.destroy_all();
        self.store.save(&config)?;
        warn!(destroyed, "vault record replaced; sessions destroyed");
        self.emit(
            SecurityEvent::ConfigReplaced,
            serde_json::json!({ "deviceKeyEnabled": config.device_key_enabled }),
        );
        Ok(())
    }

    /// Current persisted record, if any. Holds no secrets beyond the wrapped DEK.
    pub fn config(&self) -> VaultResult<Option<VaultConfig>> {
        Ok(self.store.load()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::SystemClock;
    use crate::device_key::MemoryDeviceKeyStore;
    use crate::session::DEFAULT_ABSOLUTE_LIFETIME_MS;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        vault: Vault,
        sessions: Arc<SessionManager>,
        audit: Arc<MemoryAuditSink>,
    }

    fn fixture(device_keys: Arc<dyn DeviceKeyStore>) -> Fixture {
        let dir = tempdir().unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let sessions = Arc::new(SessionManager::new(
            Arc::new(SystemClock),
            DEFAULT_ABSOLUTE_LIFETIME_MS,
        ));
        let vault = Vault::builder(dir.path().join("vault.json"))
            .device_key_store(device_keys)
            .sessions(sessions.clone())
            .rate_limiter(Arc::new(UnlockRateLimiter::new(Arc::new(SystemClock))))
            .audit_sink(audit.clone())
            .kdf_cost(KdfCost::minimal())
            .build();
        Fixture {
            _dir: dir,
            vault,
            sessions,
            audit,
        }
    }

    #[tokio::test]
    async fn states_follow_lifecycle() {
        let fx = fixture(Arc::new(MemoryDeviceKeyStore::new()));
        assert_eq!(fx.vault.state(), VaultState::Unconfigured);
        assert!(matches!(
            fx.vault.unlock("whatever pw").await,
            Err(VaultError::VaultNotConfigured)
        ));
        fx.vault
            .setup("correct horse", SetupOptions::default())
            .await
            .unwrap();
        assert_eq!(fx.vault.state(), VaultState::Unlocked);
        fx.vault.lock();
        assert_eq!(fx.vault.state(), VaultState::Locked);
        fx.vault.lock();
        assert_eq!(fx.vault.state(), VaultState::Locked);
        fx.vault.unlock("correct horse").await.unwrap();
        assert_eq!(fx.vault.state(), VaultState::Unlocked);
    }

    #[tokio::test]
    async fn setup_twice_is_rejected() {
        let fx = fixture(Arc::new(UnavailableDeviceKeyStore));
        fx.vault
            .setup("correct horse", SetupOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            fx.vault.setup("another one", SetupOptions::default()).await,
            Err(VaultError::AlreadyConfigured)
        ));
    }

    #[tokio::test]
    async fn short_password_is_rejected() {
        let fx = fixture(Arc::new(UnavailableDeviceKeyStore));
        assert!(matches!(
            fx.vault.setup("short", SetupOptions::default()).await,
            Err(VaultError::PasswordTooShort { min: 8 })
        ));
        assert_eq!(fx.vault.state(), VaultState::Unconfigured);
    }

    #[tokio::test]
    async fn require_dek_tracks_lock_state() {
        let fx = fixture(Arc::new(UnavailableDeviceKeyStore));
        assert!(matches!(fx.vault.require_dek(), Err(VaultError::VaultLocked)));
        let outcome = fx
            .vault
            .setup("correct horse", SetupOptions::default())
            .await
            .unwrap();
        let dek = fx.vault.require_dek().unwrap();
        assert_eq!(*dek, *fx.vault.dek_for(&outcome.token).unwrap());
        fx.vault.lock();
        assert!(matches!(fx.vault.require_dek(), Err(VaultError::VaultLocked)));
        assert!(matches!(
            fx.vault.dek_for(&outcome.token),
            Err(VaultError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn new_unlock_replaces_previous_session() {
        let fx = fixture(Arc::new(UnavailableDeviceKeyStore));
        let first = fx
            .vault
            .setup("correct horse", SetupOptions::default())
            .await
            .unwrap()
            .token;
        let second = fx.vault.unlock("correct horse").await.unwrap();
        assert_ne!(first, second);
        assert!(fx.vault.dek_for(&first).is_err());
        assert!(fx.vault.dek_for(&second).is_ok());
    }

    #[tokio::test]
    async fn lock_timeout_is_persisted_and_validated() {
        let fx = fixture(Arc::new(UnavailableDeviceKeyStore));
        let token = fx
            .vault
            .setup("correct horse", SetupOptions::default())
            .await
            .unwrap()
            .token;
        assert!(matches!(
            fx.vault.set_lock_timeout(&token, 0).await,
            Err(VaultError::InvalidLockTimeout { .. })
        ));
        fx.vault.set_lock_timeout(&token, 42).await.unwrap();
        assert_eq!(
            fx.vault.config().unwrap().unwrap().lock_timeout_minutes,
            Some(42)
        );
        assert_eq!(fx.vault.status().unwrap().lock_timeout_minutes, Some(42));
        assert_eq!(fx.audit.count(SecurityEvent::LockTimeoutChanged), 1);
    }

    #[tokio::test]
    async fn replace_config_force_locks() {
        let fx = fixture(Arc::new(UnavailableDeviceKeyStore));
        fx.vault
            .setup("correct horse", SetupOptions::default())
            .await
            .unwrap();
        let handed_out = fx.sessions.create(cipher::generate_key(), 60_000);
        let record = fx.vault.config().unwrap().unwrap();
        fx.vault.replace_config(record.clone()).await.unwrap();
        assert_eq!(fx.vault.state(), VaultState::Locked);
        assert!(fx.sessions.is_empty());
        assert!(fx.vault.dek_for(&handed_out).is_err());
        assert_eq!(fx.vault.config().unwrap(), Some(record));
        fx.vault.unlock("correct horse").await.unwrap();
        assert_eq!(fx.audit.count(SecurityEvent::ConfigReplaced), 1);
    }

    #[tokio::test]
    async fn failing_audit_sink_does_not_abort() {
        struct BrokenSink;
        impl AuditSink for BrokenSink {
            fn record(&self, _: SecurityEvent, _: serde_json::Value) -> anyhow::Result<()> {
                Err(anyhow::anyhow!("disk full"))
            }
        }
        let dir = tempdir().unwrap();
        let vault = Vault::builder(dir.path().join("vault.json"))
            .device_key_store(Arc::new(UnavailableDeviceKeyStore))
            .sessions(Arc::new(SessionManager::new(
                Arc::new(SystemClock),
                DEFAULT_ABSOLUTE_LIFETIME_MS,
            )))
            .rate_limiter(Arc::new(UnlockRateLimiter::new(Arc::new(SystemClock))))
            .audit_sink(Arc::new(BrokenSink))
            .kdf_cost(KdfCost::minimal())
            .build();
        vault
            .setup("correct horse", SetupOptions::default())
            .await
            .unwrap();
        vault.lock();
        assert!(matches!(
            vault.unlock("wrong password").await,
            Err(VaultError::IncorrectCredentials)
        ));
        vault.unlock("correct horse").await.unwrap();
    }

    #[tokio::test]
    async fn device_key_preference_off_means_password_only() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryDeviceKeyStore::new());
        let vault = Vault::builder(dir.path().join("vault.json"))
            .device_key_store(store.clone())
            .sessions(Arc::new(SessionManager::new(
                Arc::new(SystemClock),
                DEFAULT_ABSOLUTE_LIFETIME_MS,
            )))
            .rate_limiter(Arc::new(UnlockRateLimiter::new(Arc::new(SystemClock))))
            .kdf_cost(KdfCost::minimal())
            .use_device_key(false)
            .build();
        let outcome = vault
            .setup("correct horse", SetupOptions::default())
            .await
            .unwrap();
        assert!(!outcome.device_key_enabled);
        assert!(outcome.recovery_key.is_none());
        assert!(matches!(store.get(), DeviceKeyLookup::NotFound));
    }

    #[tokio::test]
    async fn status_reports_lockout() {
        let fx = fixture(Arc::new(UnavailableDeviceKeyStore));
        fx.vault
            .setup("correct horse", SetupOptions::default())
            .await
            .unwrap();
        fx.vault.lock();
        for _ in 0..5 {
            let _ = fx.vault.unlock("nope nope").await;
        }
        let status = fx.vault.status().unwrap();
        assert_eq!(status.state, VaultState::Locked);
        assert_eq!(status.device_key_enabled, Some(false));
        assert!(status.locked_out_secs.unwrap() > 0);
        assert_eq!(status.lockout_count, 1);
        assert!(matches!(
            fx.vault.unlock("correct horse").await,
            Err(VaultError::LockedOut { .. })
        ));
        assert_eq!(fx.audit.count(SecurityEvent::UnlockRateLimited), 1);
    }
}

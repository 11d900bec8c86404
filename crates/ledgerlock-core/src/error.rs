use thiserror::Error;

/// Low-level failures from the cipher and key derivation layers.
///
/// Every authentication or wire-format problem while decrypting collapses
/// into [`CryptoError::Decrypt`] so callers cannot tell a bad tag from a
/// truncated blob.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

/// Failures reading or writing the persisted vault record.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid vault record: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("vault record version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("invalid vault record: {0}")]
    Invalid(String),
}

/// Public error taxonomy of the vault.
///
/// Credential failures are deliberately merged into `IncorrectCredentials`;
/// `DeviceKeyMissing` stays separate because the remedy (recovery key)
/// differs from retyping a password.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault is not configured")]
    VaultNotConfigured,

    #[error("vault is already configured")]
    AlreadyConfigured,

    #[error("vault setup already in progress")]
    SetupInProgress,

    #[error("incorrect credentials")]
    IncorrectCredentials,

    #[error("device key missing from this machine; unlock with your recovery key")]
    DeviceKeyMissing,

    #[error("recovery key is not in the expected format")]
    InvalidRecoveryKeyFormat,

    #[error("this vault has no recovery key")]
    RecoveryUnavailable,

    #[error("too many failed attempts; try again in {remaining_secs}s")]
    LockedOut { remaining_secs: u64 },

    #[error("cryptographic failure")]
    CryptoFailure,

    #[error("session expired; unlock again")]
    SessionExpired,

    #[error("vault is locked")]
    VaultLocked,

    #[error("password too short (min {min} characters)")]
    PasswordTooShort { min: usize },

    #[error("lock timeout must be between {min} and {max} minutes")]
    InvalidLockTimeout { min: u32, max: u32 },

    #[error("vault record error: {0}")]
    Config(#[from] ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CryptoError> for VaultError {
    fn from(_: CryptoError) -> Self {
        VaultError::CryptoFailure
    }
}

impl VaultError {
    /// Seconds until the next unlock attempt is accepted, for a countdown.
    pub fn lockout_remaining(&self) -> Option<u64> {
        match self {
            Self::LockedOut { remaining_secs } => Some(*remaining_secs),
            _ => None,
        }
    }

    /// True for failures the user resolves by supplying other credentials.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            Self::IncorrectCredentials
                | Self::DeviceKeyMissing
                | Self::InvalidRecoveryKeyFormat
                | Self::LockedOut { .. }
        )
    }
}

pub type VaultResult<T> = Result<T, VaultError>;

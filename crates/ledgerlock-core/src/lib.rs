//! ledgerlock-core: vault security core for the Ledgerlock ledger
//!
//! # Design principles
//! - The password and the DEK are never persisted in plaintext.
//! - Intermediate keys live in `Zeroizing` buffers and are wiped on every exit path.
//! - Credential failures are reported uniformly; only a missing device key is distinct.
//!
//! # Module layout
//! - `cipher`     : XChaCha20-Poly1305 encrypt/decrypt, DEK wrapping, key wipe
//! - `kdf`        : Argon2id key derivation with scrypt fallback
//! - `device_key` : OS keyring device key + XOR combiner
//! - `recovery`   : recovery-key display form and verification hash
//! - `rate_limit` : unlock lockout with exponential backoff
//! - `session`    : in-memory DEK custody with idle/absolute expiry
//! - `config`     : persisted vault record
//! - `vault`      : setup / unlock / recover / lock / change-password
//! - `audit`      : security event sinks (hash-chained JSONL log)
//! - `settings`   : runtime settings + env overrides
//! - `paths`      : per-user data locations
//! - `clock`      : injectable time source
//! - `error`      : error taxonomy

pub mod audit;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod device_key;
pub mod error;
pub mod kdf;
pub mod paths;
pub mod rate_limit;
pub mod recovery;
pub mod session;
pub mod settings;
pub mod vault;

pub use error::{ConfigError, CryptoError, VaultError, VaultResult};
pub use session::{Session, SessionManager, SessionToken};
pub use settings::VaultSettings;
pub use vault::{SetupOptions, SetupOutcome, Vault, VaultBuilder, VaultState, VaultStatus};

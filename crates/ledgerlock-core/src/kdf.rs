//! Password-based key derivation for the key-encryption key (KEK).
//!
//! Argon2id is the primary algorithm. scrypt is the fallback, used only when
//! Argon2id cannot run with the requested parameters in this environment.
//! Both are tuned to a comparable wall-clock cost. Derivation is slow on
//! purpose; callers run it on a blocking worker, never in a retry loop.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroizing;

use crate::cipher::{KeyBytes, KEY_LEN};
use crate::error::CryptoError;

pub const SALT_LEN: usize = 32;
pub const MIN_SALT_LEN: usize = 32;

pub const ARGON2_MEMORY_KIB: u32 = 64 * 1024; // 64 MiB
pub const ARGON2_ITERATIONS: u32 = 3;
pub const ARGON2_PARALLELISM: u32 = 4;

pub const SCRYPT_LOG_N: u8 = 17; // 128 * r * 2^17 = 128 MiB
pub const SCRYPT_R: u32 = 8;
pub const SCRYPT_P: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfAlgorithm {
    Argon2id,
    Scrypt,
}

/// Cost profile used when new KDF parameters are generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KdfCost {
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
    pub scrypt_log_n: u8,
    pub scrypt_r: u32,
    pub scrypt_p: u32,
}

impl Default for KdfCost {
    fn default() -> Self {
        Self {
            argon2_memory_kib: ARGON2_MEMORY_KIB,
            argon2_iterations: ARGON2_ITERATIONS,
            argon2_parallelism: ARGON2_PARALLELISM,
            scrypt_log_n: SCRYPT_LOG_N,
            scrypt_r: SCRYPT_R,
            scrypt_p: SCRYPT_P,
        }
    }
}

impl KdfCost {
    /// Cheapest parameters both algorithms accept. Only for tests and
    /// throwaway vaults; offers no brute-force resistance.
    pub fn minimal() -> Self {
        Self {
            argon2_memory_kib: 8,
            argon2_iterations: 1,
            argon2_parallelism: 1,
            scrypt_log_n: 4,
            scrypt_r: 8,
            scrypt_p: 1,
        }
    }

    pub fn is_below_recommended(&self) -> bool {
        self.argon2_memory_kib < ARGON2_MEMORY_KIB
            || self.argon2_iterations < ARGON2_ITERATIONS
            || self.scrypt_log_n < SCRYPT_LOG_N
    }
}

/// Stored alongside the wrapped DEK. Immutable once written; a password
/// change replaces the whole value with a fresh salt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum KdfParams {
    #[serde(rename_all = "camelCase")]
    Argon2id {
        #[serde(with = "base64_bytes")]
        salt: Vec<u8>,
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
    },
    #[serde(rename_all = "camelCase")]
    Scrypt {
        #[serde(with = "base64_bytes")]
        salt: Vec<u8>,
        log_n: u8,
        r: u32,
        p: u32,
    },
}

impl KdfParams {
    pub fn argon2id(cost: &KdfCost) -> Self {
        Self::Argon2id {
            salt: generate_salt().to_vec(),
            memory_kib: cost.argon2_memory_kib,
            iterations: cost.argon2_iterations,
            parallelism: cost.argon2_parallelism,
        }
    }

    pub fn scrypt(cost: &KdfCost) -> Self {
        Self::Scrypt {
            salt: generate_salt().to_vec(),
            log_n: cost.scrypt_log_n,
            r: cost.scrypt_r,
            p: cost.scrypt_p,
        }
    }

    pub fn algorithm(&self) -> KdfAlgorithm {
        match self {
            Self::Argon2id { .. } => KdfAlgorithm::Argon2id,
            Self::Scrypt { .. } => KdfAlgorithm::Scrypt,
        }
    }

    pub fn salt(&self) -> &[u8] {
        match self {
            Self::Argon2id { salt, .. } | Self::Scrypt { salt, .. } => salt,
        }
    }
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive the 32-byte KEK for `password` under stored `params`.
pub fn derive_key(password: &str, params: &KdfParams) -> Result<KeyBytes, CryptoError> {
    if params.salt().len() < MIN_SALT_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "salt must be at least {MIN_SALT_LEN} bytes"
        )));
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    match params {
        KdfParams::Argon2id {
            salt,
            memory_kib,
            iterations,
            parallelism,
        } => {
            let params = Params::new(*memory_kib, *iterations, *parallelism, Some(KEY_LEN))
                .map_err(|e| CryptoError::KeyDerivation(format!("argon2 params: {e}")))?;
            Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                .hash_password_into(password.as_bytes(), salt, &mut key[..])
                .map_err(|e| CryptoError::KeyDerivation(format!("argon2 derive: {e}")))?;
        }
        KdfParams::Scrypt { salt, log_n, r, p } => {
            let params = scrypt::Params::new(*log_n, *r, *p, KEY_LEN)
                .map_err(|e| CryptoError::KeyDerivation(format!("scrypt params: {e}")))?;
            scrypt::scrypt(password.as_bytes(), salt, &params, &mut key[..])
                .map_err(|e| CryptoError::KeyDerivation(format!("scrypt derive: {e}")))?;
        }
    }
    Ok(key)
}

/// Generate fresh parameters and derive a KEK, preferring Argon2id and
/// falling back to scrypt when Argon2id fails in this environment.
pub fn derive_new_key(password: &str, cost: &KdfCost) -> Result<(KdfParams, KeyBytes), CryptoError> {
    let primary = KdfParams::argon2id(cost);
    match derive_key(password, &primary) {
        Ok(key) => Ok((primary, key)),
        Err(err) => {
            warn!(error = %err, "argon2id unavailable, falling back to scrypt");
            let fallback = KdfParams::scrypt(cost);
            let key = derive_key(password, &fallback)?;
            Ok((fallback, key))
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

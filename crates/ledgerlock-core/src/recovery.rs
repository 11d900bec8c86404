//! Recovery key: the raw device key rendered for the user to write down.
//!
//! Display form is 64 lowercase hex characters in eight dash-separated
//! groups. Only a SHA-256 hash of the raw key is persisted, so the vault
//! record can verify a recovery key but never reproduce it.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::cipher::{self, KeyBytes, KEY_LEN};
use crate::error::VaultError;

const GROUP_LEN: usize = 8;

/// Shown to the user exactly once, at setup.
pub struct RecoveryKey(Zeroizing<String>);

impl RecoveryKey {
    pub fn from_device_key(device_key: &[u8; KEY_LEN]) -> Self {
        let hex = Zeroizing::new(hex::encode(device_key));
        let mut out = String::with_capacity(hex.len() + hex.len() / GROUP_LEN);
        for (i, ch) in hex.chars().enumerate() {
            if i > 0 && i % GROUP_LEN == 0 {
                out.push('-');
            }
            out.push(ch);
        }
        Self(Zeroizing::new(out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecoveryKey(<redacted>)")
    }
}

/// Parse user input back into the raw 32-byte key. Whitespace, dashes and
/// case are ignored.
pub fn parse_recovery_key(input: &str) -> Result<KeyBytes, VaultError> {
    let compact: Zeroizing<String> = Zeroizing::new(
        input
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect(),
    );
    if compact.len() != KEY_LEN * 2 || !compact.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(VaultError::InvalidRecoveryKeyFormat);
    }
    let raw = Zeroizing::new(
        hex::decode(compact.as_bytes()).map_err(|_| VaultError::InvalidRecoveryKeyFormat)?,
    );
    cipher::key_from_slice(&raw).map_err(|_| VaultError::InvalidRecoveryKeyFormat)
}

/// Verification hash stored in the vault record (hex SHA-256).
pub fn recovery_hash(device_key: &[u8]) -> String {
    hex::encode(Sha256::digest(device_key))
}

/// Constant-time check of a candidate key against the stored hash.
pub fn verify_recovery_hash(candidate: &[u8], stored_hash: &str) -> bool {
    let Ok(expected) = hex::decode(stored_hash) else {
        return false;
    };
    let actual = Sha256::digest(candidate);
    actual.as_slice().ct_eq(&expected).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_form_is_grouped_hex() {
        let key = [0xabu8; KEY_LEN];
        let rk = RecoveryKey::from_device_key(&key);
        let groups: Vec<&str> = rk.as_str().split('-').collect();
        assert_eq!(groups.len(), 8);
        assert!(groups.iter().all(|g| g.len() == 8 && *g == "abababab"));
    }

    #[test]
    fn parse_accepts_sloppy_input() {
        let key = cipher::generate_key();
        let rk = RecoveryKey::from_device_key(&key);
        let sloppy = format!("  {}\n", rk.as_str().to_uppercase().replace('-', " "));
        let parsed = parse_recovery_key(&sloppy).unwrap();
        assert_eq!(*parsed, *key);
    }

    #[test]
    fn parse_rejects_wrong_shape() {
        let cases = [
            String::new(),
            "abcd".to_string(),
            "g".repeat(64),
            "a".repeat(63),
            "a".repeat(66),
        ];
        for bad in &cases {
            assert!(matches!(
                parse_recovery_key(bad),
                Err(VaultError::InvalidRecoveryKeyFormat)
            ));
        }
    }

    #[test]
    fn hash_verifies_only_matching_key() {
        let key = cipher::generate_key();
        let other = cipher::generate_key();
        let stored = recovery_hash(&key[..]);
        assert_eq!(stored.len(), 64);
        assert!(verify_recovery_hash(&key[..], &stored));
        assert!(!verify_recovery_hash(&other[..], &stored));
        assert!(!verify_recovery_hash(&key[..], "not-hex"));
        assert!(!verify_recovery_hash(&key[..], &stored[..32]));
    }

    #[test]
    fn debug_is_redacted() {
        let rk = RecoveryKey::from_device_key(&[1u8; KEY_LEN]);
        assert_eq!(format!("{rk:?}"), "RecoveryKey(<redacted>)");
    }
}

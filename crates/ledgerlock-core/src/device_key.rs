//! Device key: a random 32-byte secret held in the platform credential store
//! (Windows Credential Manager, macOS Keychain, Linux Secret Service).
//!
//! Every platform-store failure collapses to "unavailable" or "not found".
//! A machine without a usable store runs the vault in password-only mode;
//! that is a configuration state, not an error.

use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use parking_lot::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::cipher::{self, KeyBytes, KEY_LEN};
use crate::error::CryptoError;

pub const KEYRING_SERVICE: &str = "Ledgerlock";
pub const KEYRING_ACCOUNT: &str = "vault_device_key";

/// Outcome of reading the device key without creating it.
pub enum DeviceKeyLookup {
    Found(KeyBytes),
    NotFound,
    Unavailable,
}

impl DeviceKeyLookup {
    pub fn into_key(self) -> Option<KeyBytes> {
        match self {
            Self::Found(key) => Some(key),
            Self::NotFound | Self::Unavailable => None,
        }
    }
}

impl std::fmt::Debug for DeviceKeyLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Found(_) => f.write_str("Found(<redacted>)"),
            Self::NotFound => f.write_str("NotFound"),
            Self::Unavailable => f.write_str("Unavailable"),
        }
    }
}

pub trait DeviceKeyStore: Send + Sync {
    /// Return the device key, generating and persisting one on first use.
    /// `None` means the platform store cannot be used on this machine.
    fn get_or_create(&self) -> Option<KeyBytes>;

    fn get(&self) -> DeviceKeyLookup;

    /// Remove the device key. Missing entries and store errors are ignored.
    fn delete(&self);
}

/// XOR two independent 32-byte keys into the wrapping key.
pub fn combine(kek: &[u8], device_key: &[u8]) -> Result<KeyBytes, CryptoError> {
    if kek.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(kek.len()));
    }
    if device_key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(device_key.len()));
    }
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    for (o, (a, b)) in out.iter_mut().zip(kek.iter().zip(device_key.iter())) {
        *o = a ^ b;
    }
    Ok(out)
}

// ── OS keyring ───────────────────────────────────────────────────────────────

pub struct KeyringDeviceKeyStore {
    service: String,
    account: String,
}

impl KeyringDeviceKeyStore {
    pub fn new(service: &str, account: &str) -> Self {
        Self {
            service: service.to_string(),
            account: account.to_string(),
        }
    }

    fn entry(&self) -> Option<Entry> {
        match Entry::new(&self.service, &self.account) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "keyring init failed");
                None
            }
        }
    }

    fn decode(encoded: &str) -> Option<KeyBytes> {
        let raw = Zeroizing::new(general_purpose::STANDARD.decode(encoded.trim()).ok()?);
        cipher::key_from_slice(&raw).ok()
    }
}

impl Default for KeyringDeviceKeyStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
    }
}

impl DeviceKeyStore for KeyringDeviceKeyStore {
    fn get_or_create(&self) -> Option<KeyBytes> {
        match self.get() {
            DeviceKeyLookup::Found(key) => return Some(key),
            DeviceKeyLookup::Unavailable => return None,
            DeviceKeyLookup::NotFound => {}
        }
        let entry = self.entry()?;
        let key = cipher::generate_key();
        let encoded = Zeroizing::new(general_purpose::STANDARD.encode(&key[..]));
        if let Err(e) = entry.set_password(&encoded) {
            warn!(error = %e, "keyring store device key failed");
            return None;
        }
        // some backends accept writes they never persist; confirm by reading back
        match self.get() {
            DeviceKeyLookup::Found(stored) if *stored == *key => Some(key),
            _ => {
                warn!("keyring did not retain device key");
                None
            }
        }
    }

    fn get(&self) -> DeviceKeyLookup {
        let Some(entry) = self.entry() else {
            return DeviceKeyLookup::Unavailable;
        };
        match entry.get_password() {
            Ok(encoded) => {
                let encoded = Zeroizing::new(encoded);
                match Self::decode(&encoded) {
                    Some(key) => DeviceKeyLookup::Found(key),
                    None => {
                        warn!("keyring device key entry is malformed");
                        DeviceKeyLookup::Unavailable
                    }
                }
            }
            Err(keyring::Error::NoEntry) => DeviceKeyLookup::NotFound,
            Err(e) => {
                debug!(error = %e, "keyring load device key failed");
                DeviceKeyLookup::Unavailable
            }
        }
    }

    fn delete(&self) {
        if let Some(entry) = self.entry() {
            if let Err(e) = entry.delete_password() {
                debug!(error = %e, "keyring delete device key failed");
            }
        }
    }
}

// ── No platform store ────────────────────────────────────────────────────────

/// Store for environments without a credential store: always unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableDeviceKeyStore;

impl DeviceKeyStore for UnavailableDeviceKeyStore {
    fn get_or_create(&self) -> Option<KeyBytes> {
        None
    }

    fn get(&self) -> DeviceKeyLookup {
        DeviceKeyLookup::Unavailable
    }

    fn delete(&self) {}
}

// ── In-process store ─────────────────────────────────────────────────────────

/// Process-local store. Useful for embedding and for simulating a platform
/// store (including its loss via [`DeviceKeyStore::delete`]).
#[derive(Default)]
pub struct MemoryDeviceKeyStore {
    slot: Mutex<Option<KeyBytes>>,
}

impl MemoryDeviceKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceKeyStore for MemoryDeviceKeyStore {
    fn get_or_create(&self) -> Option<KeyBytes> {
        let mut slot = self.slot.lock();
        let key = slot.get_or_insert_with(cipher::generate_key);
        Some(Zeroizing::new(**key))
    }

    fn get(&self) -> DeviceKeyLookup {
        match self.slot.lock().as_ref() {
            Some(key) => DeviceKeyLookup::Found(Zeroizing::new(**key)),
            None => DeviceKeyLookup::NotFound,
        }
    }

    fn delete(&self) {
        // dropping the Zeroizing wrapper wipes the old key
        self.slot.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_is_xor() {
        let a = [0b1010_1010u8; KEY_LEN];
        let b = [0b0110_0110u8; KEY_LEN];
        let c = combine(&a, &b).unwrap();
        assert!(c.iter().all(|x| *x == 0b1100_1100));
        // XOR with the same device key recovers the KEK
        let back = combine(&c[..], &b).unwrap();
        assert_eq!(*back, a);
    }

    #[test]
    fn combine_fails_closed_on_length() {
        assert!(matches!(
            combine(&[0u8; 31], &[0u8; 32]),
            Err(CryptoError::InvalidKeyLength(31))
        ));
        assert!(matches!(
            combine(&[0u8; 32], &[0u8; 64]),
            Err(CryptoError::InvalidKeyLength(64))
        ));
    }

    #[test]
    fn memory_store_is_stable_until_deleted() {
        let store = MemoryDeviceKeyStore::new();
        assert!(matches!(store.get(), DeviceKeyLookup::NotFound));
        let first = store.get_or_create().unwrap();
        let second = store.get_or_create().unwrap();
        assert_eq!(*first, *second);
        assert_eq!(*store.get().into_key().unwrap(), *first);

        store.delete();
        assert!(matches!(store.get(), DeviceKeyLookup::NotFound));
        let regenerated = store.get_or_create().unwrap();
        assert_ne!(*regenerated, *first);
    }

    #[test]
    fn unavailable_store_never_yields_a_key() {
        let store = UnavailableDeviceKeyStore;
        assert!(store.get_or_create().is_none());
        assert!(matches!(store.get(), DeviceKeyLookup::Unavailable));
        store.delete();
    }

    #[test]
    fn lookup_debug_is_redacted() {
        let lookup = DeviceKeyLookup::Found(cipher::generate_key());
        assert_eq!(format!("{lookup:?}"), "Found(<redacted>)");
    }
}

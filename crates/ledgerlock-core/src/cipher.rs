//! Authenticated encryption for wrapped keys and record columns.
//!
//! Uses XChaCha20-Poly1305.
//! Key size: 32 bytes.  Nonce: 24 bytes (random per call).  Tag: 16 bytes.
//!
//! Wire format, base64 (standard alphabet):
//!   [ nonce (24 bytes) | tag (16 bytes) | ciphertext ]
//!
//! The format carries no version byte; the nonce travels with the blob so
//! the key alone is enough to decrypt.

use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::{
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
    Tag, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// A raw 256-bit key, wiped when dropped.
pub type KeyBytes = Zeroizing<[u8; KEY_LEN]>;

/// Fresh random 256-bit key (used for DEKs and device keys).
pub fn generate_key() -> KeyBytes {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::rngs::OsRng.fill_bytes(&mut key[..]);
    key
}

/// Copy a slice into an owned key, failing closed on the wrong length.
pub fn key_from_slice(bytes: &[u8]) -> Result<KeyBytes, CryptoError> {
    if bytes.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(bytes.len()));
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(bytes);
    Ok(key)
}

/// Overwrite a key buffer with zeros in place.
pub fn wipe(buf: &mut [u8]) {
    buf.zeroize();
}

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }
    XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))
}

/// Encrypt `plaintext` under a 32-byte key into the base64 wire format.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<String, CryptoError> {
    let cipher = cipher_for(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let mut buffer = Zeroizing::new(plaintext.to_vec());
    let tag = cipher
        .encrypt_in_place_detached(&nonce, b"", buffer.as_mut_slice())
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + buffer.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&buffer);
    Ok(general_purpose::STANDARD.encode(out))
}

/// Decrypt a blob produced by [`encrypt`].
///
/// Any failure (bad base64, short blob, tag mismatch) is reported as
/// [`CryptoError::Decrypt`].
pub fn decrypt(blob: &str, key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = cipher_for(key)?;
    let data = general_purpose::STANDARD
        .decode(blob)
        .map_err(|_| CryptoError::Decrypt)?;
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Decrypt);
    }
    let (nonce, rest) = data.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(nonce),
            b"",
            buffer.as_mut_slice(),
            Tag::from_slice(tag),
        )
        .map_err(|_| CryptoError::Decrypt)?;
    Ok(buffer)
}

pub fn encrypt_json<T: Serialize>(value: &T, key: &[u8]) -> Result<String, CryptoError> {
    let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
    encrypt(&plaintext, key)
}

pub fn decrypt_json<T: DeserializeOwned>(blob: &str, key: &[u8]) -> Result<T, CryptoError> {
    let plaintext = decrypt(blob, key)?;
    serde_json::from_slice(&plaintext).map_err(|_| CryptoError::Decrypt)
}

/// Wrap a 32-byte key (the DEK) under a wrapping key.
pub fn wrap_key(key_to_wrap: &[u8; KEY_LEN], wrapping_key: &[u8]) -> Result<String, CryptoError> {
    encrypt(key_to_wrap, wrapping_key)
}

/// Unwrap a key produced by [`wrap_key`].
pub fn unwrap_key(wrapped: &str, wrapping_key: &[u8]) -> Result<KeyBytes, CryptoError> {
    let plaintext = decrypt(wrapped, wrapping_key)?;
    key_from_slice(&plaintext).map_err(|_| CryptoError::Decrypt)
}

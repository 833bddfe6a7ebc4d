//! Key derivation with BLAKE2s
//!
//! Turns the human supplied shared key into a 32-byte cipher key using
//! HMAC-BLAKE2s in an extract-then-expand construction.

use blake2::{digest::FixedOutput, Blake2s256, Digest};
use hmac::{Mac, SimpleHmac};

use crate::error::CryptoError;

/// HMAC-BLAKE2s (RFC 2104 HMAC with BLAKE2s-256)
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// Domain separation label for the frame cipher key
const KEY_LABEL: &[u8] = b"vtunnel shared key v1";

/// BLAKE2s-256 hash of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// HMAC-BLAKE2s
pub fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; HASH_LEN], CryptoError> {
    let mut mac =
        <HmacBlake2s as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
    Mac::update(&mut mac, data);
    Ok(mac.finalize_fixed().into())
}

/// Single-output KDF: T1 = HMAC(HMAC(key, input), 0x01)
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> Result<[u8; HASH_LEN], CryptoError> {
    let temp = hmac(key, input)?;
    hmac(&temp, &[0x01])
}

/// Derive the frame cipher key from a shared secret
pub fn derive_frame_key(shared_key: &[u8]) -> Result<[u8; HASH_LEN], CryptoError> {
    if shared_key.is_empty() {
        return Err(CryptoError::InvalidKey);
    }
    kdf1(&hash(KEY_LABEL), shared_key)
}

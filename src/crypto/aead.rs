//! AEAD encryption for tunnel frames
//!
//! Implements ChaCha20-Poly1305 with a random per-frame nonce carried in
//! front of the ciphertext.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;

use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// Bytes added to every sealed frame
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Encrypt plaintext under a fresh random nonce
///
/// Output layout: `nonce (12) || ciphertext || tag (16)`.
pub fn seal(cipher: &ChaCha20Poly1305, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)?;

    let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    frame.extend_from_slice(&nonce_bytes);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Decrypt a frame produced by [`seal`]
pub fn open(cipher: &ChaCha20Poly1305, frame: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if frame.len() < OVERHEAD {
        return Err(CryptoError::Truncated { len: frame.len() });
    }

    let (nonce_bytes, ciphertext) = frame.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// Build a cipher instance from a raw key
pub fn cipher(key: &[u8; KEY_LEN]) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key))
}

//! Frame encryption
//!
//! - Key derivation from the shared key (kdf)
//! - ChaCha20-Poly1305 AEAD sealing (aead)
//! - [`CipherCodec`], the object the forwarding loops encrypt and decrypt with

pub mod aead;
pub mod kdf;

use std::fmt;

use chacha20poly1305::ChaCha20Poly1305;

use crate::error::CryptoError;

/// Keyed encrypt/decrypt of opaque tunnel frames
///
/// Holds no per-frame state, so one codec can be shared by both forwarding
/// directions without locking.
#[derive(Clone)]
pub struct CipherCodec {
    cipher: ChaCha20Poly1305,
}

impl CipherCodec {
    /// Bytes a frame grows by when encrypted
    pub const OVERHEAD: usize = aead::OVERHEAD;

    /// Build a codec from the configured shared key
    pub fn new(shared_key: &str) -> Result<Self, CryptoError> {
        let key = kdf::derive_frame_key(shared_key.as_bytes())?;
        Ok(Self {
            cipher: aead::cipher(&key),
        })
    }

    /// Encrypt one packet into a frame
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aead::seal(&self.cipher, plaintext, &[])
    }

    /// Decrypt one frame back into a packet
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aead::open(&self.cipher, ciphertext, &[])
    }
}

impl fmt::Debug for CipherCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherCodec").finish_non_exhaustive()
    }
}

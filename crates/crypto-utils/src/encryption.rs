use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};

use crate::error::CryptoError;

/// AES-256-GCM nonce (IV) size in bytes.
pub const NONCE_SIZE: usize = 12;

/// AES-256-GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Ciphertext with its nonce kept apart, for formats that store the IV in a
/// separate field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext followed by the 16-byte tag.
    pub ciphertext: Vec<u8>,
}

/// Encrypts `plaintext` under a fresh random nonce.
pub fn seal(plaintext: &[u8], key: &[u8; 32]) -> Result<SealedBox, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&nonce);

    Ok(SealedBox {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypts a [`SealedBox`]. Any authentication failure maps to
/// [`CryptoError::DecryptionFailed`].
pub fn open(sealed: &SealedBox, key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    if sealed.ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)
}

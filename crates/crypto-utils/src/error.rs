use thiserror::Error;

/// Cryptographic operation errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Wrong key or tampered ciphertext. The cause is deliberately not
    /// distinguished.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key derivation failed: {0}")]
    KdfFailed(String),

    #[error("pbkdf2 iteration count {got} is below the minimum of {min}")]
    WeakIterationCount { got: u32, min: u32 },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

use argon2::{Algorithm, Argon2, Params, Version};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Lowest PBKDF2 iteration count accepted for key backups, on both the
/// export and the import side.
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt length used by both KDFs.
pub const SALT_SIZE: usize = 16;

/// Argon2id cost parameters. Stored alongside the salt so a store written
/// with one setting can be reopened after the default changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argon2Params {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for Argon2Params {
    /// 64 MiB, 3 passes, 4 lanes.
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

/// Derives a 32-byte key from `password` and `salt` using Argon2id with the
/// default parameters.
pub fn derive_key(
    password: &[u8],
    salt: &[u8; SALT_SIZE],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    derive_key_with(password, salt, &Argon2Params::default())
}

/// Derives a 32-byte key using Argon2id with explicit cost parameters.
pub fn derive_key_with(
    password: &[u8],
    salt: &[u8; SALT_SIZE],
    params: &Argon2Params,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| CryptoError::KdfFailed(format!("invalid argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password, salt, &mut output[..])
        .map_err(|e| CryptoError::KdfFailed(format!("argon2 hash failed: {e}")))?;

    Ok(output)
}

/// PBKDF2-HMAC-SHA256 producing a 32-byte key. Iteration counts below
/// [`MIN_PBKDF2_ITERATIONS`] are refused.
pub fn pbkdf2_sha256(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    if iterations < MIN_PBKDF2_ITERATIONS {
        return Err(CryptoError::WeakIterationCount {
            got: iterations,
            min: MIN_PBKDF2_ITERATIONS,
        });
    }
    if salt.is_empty() {
        return Err(CryptoError::InvalidInput("empty pbkdf2 salt".into()));
    }
    Ok(pbkdf2_unchecked(password, salt, iterations))
}

fn pbkdf2_unchecked(password: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut output = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output[..]);
    output
}

/// Generates a cryptographically secure random 16-byte salt.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

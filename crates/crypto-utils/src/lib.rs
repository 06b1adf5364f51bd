//! # crypto-utils
//!
//! Authenticated encryption and password-based key derivation used by the
//! wallet store (Argon2id) and by key backups (PBKDF2-HMAC-SHA256).

pub mod encryption;
pub mod error;
pub mod kdf;

pub use error::CryptoError;
pub use kdf::{Argon2Params, MIN_PBKDF2_ITERATIONS};

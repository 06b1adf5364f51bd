//! Private key backups and the password attempt limiter.
//!
//! A backup is a JSON document describing one imported or HD key. The key
//! is either plaintext WIF or AES-256-GCM ciphertext under a
//! PBKDF2-HMAC-SHA256 key. A bare WIF string is accepted on import too; it
//! is also the QR payload of a plaintext export.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chain_btc::wif::WifKey;
use chain_btc::{AddressType, BtcNetwork};
use chrono::{DateTime, Utc};
use crypto_utils::encryption::{self, SealedBox, NONCE_SIZE};
use crypto_utils::kdf;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::error::WalletError;

pub const BACKUP_VERSION: u32 = 1;

const KDF_NAME: &str = "pbkdf2-sha256";

/// Most PBKDF2 rounds a backup may ask for. Imported files are untrusted
/// and the count is read before the password is checked.
pub const MAX_BACKUP_ITERATIONS: u32 = 10_000_000;

/// Failed password attempts allowed before lockouts start.
pub const FREE_ATTEMPTS: u32 = 5;
const BASE_LOCKOUT_SECS: u64 = 30;
const MAX_LOCKOUT_SECS: u64 = 3_600;

#[derive(Clone, Serialize, Deserialize)]
pub struct KeyBackup {
    pub version: u32,
    pub account_name: String,
    pub address_type: AddressType,
    pub first_address: String,
    pub network: BtcNetwork,
    pub created_at: DateTime<Utc>,
    pub key: BackupKey,
}

impl std::fmt::Debug for KeyBackup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBackup")
            .field("version", &self.version)
            .field("account_name", &self.account_name)
            .field("address_type", &self.address_type)
            .field("first_address", &self.first_address)
            .field("network", &self.network)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum BackupKey {
    Plaintext {
        wif: String,
    },
    Encrypted {
        kdf: String,
        iterations: u32,
        salt: String,
        iv: String,
        ciphertext: String,
    },
}

impl Drop for BackupKey {
    fn drop(&mut self) {
        if let BackupKey::Plaintext { wif } = self {
            wif.zeroize();
        }
    }
}

/// Result of an export.
#[derive(Serialize)]
pub struct ExportedKey {
    /// The backup document as JSON.
    pub backup: String,
    /// What a QR code should carry: the WIF itself. Absent for encrypted
    /// exports.
    pub qr_payload: Option<String>,
}

impl Drop for ExportedKey {
    fn drop(&mut self) {
        self.backup.zeroize();
        if let Some(payload) = self.qr_payload.as_mut() {
            payload.zeroize();
        }
    }
}

impl std::fmt::Debug for ExportedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedKey")
            .field("backup", &"[REDACTED]")
            .field("qr_payload", &self.qr_payload.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Account metadata stored next to the key.
#[derive(Debug, Clone)]
pub struct BackupInfo<'a> {
    pub account_name: &'a str,
    pub address_type: AddressType,
    pub first_address: &'a str,
}

/// Writes a backup of `key`, encrypted when `password` is given.
pub fn export_backup(
    key: &WifKey,
    info: &BackupInfo<'_>,
    password: Option<&str>,
    iterations: u32,
) -> Result<ExportedKey, WalletError> {
    let wif = Zeroizing::new(key.encode());
    let backup_key = match password {
        None => BackupKey::Plaintext {
            wif: wif.to_string(),
        },
        Some(password) => {
            let salt = kdf::generate_salt();
            let derived = kdf::pbkdf2_sha256(password.as_bytes(), &salt, iterations)?;
            let sealed = encryption::seal(wif.as_bytes(), &derived)?;
            BackupKey::Encrypted {
                kdf: KDF_NAME.into(),
                iterations,
                salt: BASE64.encode(salt),
                iv: BASE64.encode(sealed.nonce),
                ciphertext: BASE64.encode(&sealed.ciphertext),
            }
        }
    };

    let backup = KeyBackup {
        version: BACKUP_VERSION,
        account_name: info.account_name.to_string(),
        address_type: info.address_type,
        first_address: info.first_address.to_string(),
        network: key.network(),
        created_at: Utc::now(),
        key: backup_key,
    };
    let json = serde_json::to_string_pretty(&backup)
        .map_err(|e| WalletError::Internal(format!("serialize backup: {e}")))?;

    Ok(ExportedKey {
        backup: json,
        qr_payload: password.is_none().then(|| wif.to_string()),
    })
}

/// A key recovered from a backup or a bare WIF.
pub struct DecodedBackup {
    pub key: WifKey,
    /// `None` for a bare WIF.
    pub metadata: Option<BackupMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupMetadata {
    pub account_name: String,
    pub address_type: AddressType,
    pub first_address: String,
}

/// Parses `blob`, which is either a backup document or a WIF string.
///
/// A wrong password fails [`WalletError::DecryptionFailed`]. An encrypted
/// backup with fewer than 100 000 or more than [`MAX_BACKUP_ITERATIONS`]
/// PBKDF2 iterations is refused.
pub fn decode_backup(
    blob: &str,
    password: Option<&str>,
    network: BtcNetwork,
) -> Result<DecodedBackup, WalletError> {
    let blob = blob.trim();
    if !blob.starts_with('{') {
        let key = WifKey::decode(blob)?;
        network.ensure_matches(key.network())?;
        return Ok(DecodedBackup {
            key,
            metadata: None,
        });
    }

    let backup: KeyBackup = serde_json::from_str(blob)
        .map_err(|e| WalletError::InvalidWif(format!("malformed backup: {e}")))?;
    if backup.version != BACKUP_VERSION {
        return Err(WalletError::Unsupported(format!(
            "backup version {}",
            backup.version
        )));
    }
    network.ensure_matches(backup.network)?;

    let key = match &backup.key {
        BackupKey::Plaintext { wif } => WifKey::decode(wif)?,
        BackupKey::Encrypted {
            kdf: kdf_name,
            iterations,
            salt,
            iv,
            ciphertext,
        } => {
            if kdf_name != KDF_NAME {
                return Err(WalletError::Unsupported(format!("backup kdf {kdf_name}")));
            }
            if *iterations > MAX_BACKUP_ITERATIONS {
                return Err(WalletError::Unsupported(format!(
                    "backup asks for {iterations} pbkdf2 iterations, at most {MAX_BACKUP_ITERATIONS} are allowed"
                )));
            }
            let password = password.ok_or_else(|| {
                WalletError::Unsupported("backup is encrypted and no password was given".into())
            })?;
            let salt = decode_field(salt, "salt")?;
            let nonce: [u8; NONCE_SIZE] = decode_field(iv, "iv")?
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::InvalidWif(format!("iv must be {NONCE_SIZE} bytes")))?;
            let ciphertext = decode_field(ciphertext, "ciphertext")?;

            let derived = kdf::pbkdf2_sha256(password.as_bytes(), &salt, *iterations)?;
            let plaintext = Zeroizing::new(encryption::open(&SealedBox { nonce, ciphertext }, &derived)?);
            let wif = std::str::from_utf8(&plaintext)
                .map_err(|_| WalletError::InvalidWif("decrypted key is not text".into()))?;
            WifKey::decode(wif)?
        }
    };
    network.ensure_matches(key.network())?;

    Ok(DecodedBackup {
        key,
        metadata: Some(BackupMetadata {
            account_name: backup.account_name.clone(),
            address_type: backup.address_type,
            first_address: backup.first_address.clone(),
        }),
    })
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>, WalletError> {
    BASE64
        .decode(value)
        .map_err(|e| WalletError::InvalidWif(format!("backup {field}: {e}")))
}

#[derive(Debug, Default)]
struct GuardState {
    failures: u32,
    locked_until: i64,
}

/// Limits password guessing.
///
/// After [`FREE_ATTEMPTS`] consecutive wrong passwords every further
/// failure locks attempts out for 30 s, doubling each time up to an hour.
/// A correct password resets the count.
#[derive(Debug, Default)]
pub struct PasswordGuard {
    state: Mutex<GuardState>,
}

impl PasswordGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails [`WalletError::RateLimited`] while locked out.
    pub fn check(&self, now: i64) -> Result<(), WalletError> {
        let state = self.state.lock();
        if now < state.locked_until {
            return Err(WalletError::RateLimited {
                retry_after_secs: (state.locked_until - now) as u64,
            });
        }
        Ok(())
    }

    pub fn record_failure(&self, now: i64) {
        let mut state = self.state.lock();
        state.failures += 1;
        if state.failures >= FREE_ATTEMPTS {
            let doublings = (state.failures - FREE_ATTEMPTS).min(16);
            let lockout = (BASE_LOCKOUT_SECS << doublings).min(MAX_LOCKOUT_SECS);
            state.locked_until = now + lockout as i64;
            tracing::warn!(failures = state.failures, lockout_secs = lockout, "password attempts locked out");
        }
    }

    pub fn record_success(&self) {
        *self.state.lock() = GuardState::default();
    }

    pub fn failures(&self) -> u32 {
        self.state.lock().failures
    }

    /// Runs a password-checking operation under the limiter. Only
    /// [`WalletError::DecryptionFailed`] counts as a failed attempt.
    pub fn attempt<T>(
        &self,
        now: i64,
        op: impl FnOnce() -> Result<T, WalletError>,
    ) -> Result<T, WalletError> {
        self.check(now)?;
        match op() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(WalletError::DecryptionFailed) => {
                self.record_failure(now);
                Err(WalletError::DecryptionFailed)
            }
            Err(other) => Err(other),
        }
    }
}

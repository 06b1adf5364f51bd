use chain_btc::BtcError;
use crypto_utils::CryptoError;
use thiserror::Error;

use crate::types::AccountId;

/// Every failure the engine reports.
///
/// Messages carry ids, amounts and addresses, never key material.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("derivation failed: {0}")]
    Derivation(String),

    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("invalid WIF: {0}")]
    InvalidWif(String),

    #[error("network mismatch: expected {expected}, found {found}")]
    NetworkMismatch { expected: String, found: String },

    #[error("{address_type} is not available: {reason}")]
    IncompatibleAddressType {
        address_type: String,
        reason: String,
    },

    #[error("insufficient funds: have {have} sat, need {need} sat")]
    InsufficientFunds { have: u64, need: u64 },

    #[error("gap limit reached: {limit} issued receive addresses are unused")]
    GapLimitExceeded { limit: u32 },

    #[error("threshold not met: {have} of {need} signatures")]
    ThresholdNotMet { have: usize, need: usize },

    #[error("PSBT spends a different transaction")]
    ForeignTransaction,

    #[error("inputs are no longer spendable: {}", .0.join(", "))]
    StaleInputs(Vec<String>),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("too many failed attempts, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("invalid extended public key: {0}")]
    InvalidXpub(String),

    #[error("invalid cosigners: {0}")]
    InvalidCosigners(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("too many inputs: selection needs {needed}, limit is {max}")]
    TooManyInputs { needed: usize, max: usize },

    #[error("fee {fee} sat exceeds ceiling of {ceiling} sat")]
    FeeCeilingExceeded { fee: u64, ceiling: u64 },

    #[error("transaction {0} was already broadcast")]
    AlreadyBroadcast(String),

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("unknown transaction: {0}")]
    UnknownTransaction(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid PSBT: {0}")]
    InvalidPsbt(String),

    #[error("chain backend error: {0}")]
    Backend(String),

    #[error("wallet store is corrupted: {0}")]
    StoreCorrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WalletError {
    /// Stable, machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            WalletError::Derivation(_) => "derivation",
            WalletError::InvalidMnemonic(_) => "invalid_mnemonic",
            WalletError::InvalidWif(_) => "invalid_wif",
            WalletError::NetworkMismatch { .. } => "network_mismatch",
            WalletError::IncompatibleAddressType { .. } => "incompatible_address_type",
            WalletError::InsufficientFunds { .. } => "insufficient_funds",
            WalletError::GapLimitExceeded { .. } => "gap_limit_exceeded",
            WalletError::ThresholdNotMet { .. } => "threshold_not_met",
            WalletError::ForeignTransaction => "foreign_transaction",
            WalletError::StaleInputs(_) => "stale_inputs",
            WalletError::DecryptionFailed => "decryption_failed",
            WalletError::RateLimited { .. } => "rate_limited",
            WalletError::DuplicateKey(_) => "duplicate_key",
            WalletError::InvalidXpub(_) => "invalid_xpub",
            WalletError::InvalidCosigners(_) => "invalid_cosigners",
            WalletError::InvalidAmount(_) => "invalid_amount",
            WalletError::TooManyInputs { .. } => "too_many_inputs",
            WalletError::FeeCeilingExceeded { .. } => "fee_ceiling_exceeded",
            WalletError::AlreadyBroadcast(_) => "already_broadcast",
            WalletError::AccountNotFound(_) => "account_not_found",
            WalletError::UnknownTransaction(_) => "unknown_transaction",
            WalletError::Unsupported(_) => "unsupported",
            WalletError::InvalidAddress(_) => "invalid_address",
            WalletError::InvalidPsbt(_) => "invalid_psbt",
            WalletError::Backend(_) => "backend",
            WalletError::StoreCorrupted(_) => "store_corrupted",
            WalletError::Io(_) => "io",
            WalletError::Internal(_) => "internal",
        }
    }

    /// Only a corrupted store is unrecoverable; everything else leaves the
    /// wallet usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WalletError::StoreCorrupted(_))
    }
}

impl From<BtcError> for WalletError {
    fn from(e: BtcError) -> Self {
        match e {
            BtcError::InvalidPrivateKey(msg) | BtcError::InvalidWif(msg) => {
                WalletError::InvalidWif(msg)
            }
            BtcError::InvalidPublicKey(msg) | BtcError::InvalidMultisig(msg) => {
                WalletError::Derivation(msg)
            }
            BtcError::InvalidAddress(msg) => WalletError::InvalidAddress(msg),
            BtcError::NetworkMismatch { expected, found } => {
                WalletError::NetworkMismatch { expected, found }
            }
            BtcError::IncompatibleAddressType {
                address_type,
                reason,
            } => WalletError::IncompatibleAddressType {
                address_type,
                reason: format!("cannot be rendered from {reason}"),
            },
            BtcError::InsufficientFunds { have, need } => {
                WalletError::InsufficientFunds { have, need }
            }
            BtcError::TooManyInputs { needed, max } => WalletError::TooManyInputs { needed, max },
            BtcError::FeeCeilingExceeded { fee, ceiling } => {
                WalletError::FeeCeilingExceeded { fee, ceiling }
            }
            BtcError::InsufficientSignatures { have, need } => {
                WalletError::ThresholdNotMet { have, need }
            }
            BtcError::InvalidPsbt(msg) | BtcError::InvalidSignature(msg) => {
                WalletError::InvalidPsbt(msg)
            }
            BtcError::AmountOutOfRange(msg) => WalletError::InvalidAmount(msg),
            BtcError::UnsignedTxMismatch => WalletError::ForeignTransaction,
            BtcError::TransactionBuildError(msg) | BtcError::SigningError(msg) => {
                WalletError::Internal(format!("BTC: {msg}"))
            }
        }
    }
}

impl From<CryptoError> for WalletError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::DecryptionFailed => WalletError::DecryptionFailed,
            CryptoError::WeakIterationCount { .. } => WalletError::Unsupported(e.to_string()),
            other => WalletError::Internal(format!("crypto: {other}")),
        }
    }
}

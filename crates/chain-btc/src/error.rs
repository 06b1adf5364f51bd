use thiserror::Error;

/// Bitcoin chain operation errors.
#[derive(Debug, Error)]
pub enum BtcError {
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("address is for {found}, wallet is on {expected}")]
    NetworkMismatch { expected: String, found: String },

    #[error("invalid WIF: {0}")]
    InvalidWif(String),

    #[error("{address_type} cannot be rendered from {reason}")]
    IncompatibleAddressType {
        address_type: String,
        reason: String,
    },

    #[error("invalid multisig parameters: {0}")]
    InvalidMultisig(String),

    /// Spendable value is below what the payment plus fee requires.
    #[error("insufficient funds: have {have} sat, need {need} sat")]
    InsufficientFunds { have: u64, need: u64 },

    #[error("selection needs {needed} inputs, limit is {max}")]
    TooManyInputs { needed: usize, max: usize },

    #[error("fee {fee} sat exceeds ceiling of {ceiling} sat")]
    FeeCeilingExceeded { fee: u64, ceiling: u64 },

    #[error("amount out of range: {0}")]
    AmountOutOfRange(String),

    #[error("{have} of {need} required signatures present")]
    InsufficientSignatures { have: usize, need: usize },

    #[error("transaction build error: {0}")]
    TransactionBuildError(String),

    #[error("signing error: {0}")]
    SigningError(String),

    #[error("invalid PSBT: {0}")]
    InvalidPsbt(String),

    /// A partial signature that does not verify, or comes from a key that
    /// cannot spend the input.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("PSBTs spend different unsigned transactions")]
    UnsignedTxMismatch,
}

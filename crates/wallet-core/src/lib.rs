//! # wallet-core
//!
//! Transaction engine of a Bitcoin browser-extension wallet: HD, imported
//! and multisig accounts, address derivation, privacy-aware transaction
//! building, PSBT signing across cosigners, delayed broadcast and key
//! backups. The UI talks to it through [`rpc::dispatch`] or directly
//! through [`WalletEngine`].

pub mod backend;
pub mod backup;
pub mod change;
pub mod config;
pub mod derivation;
pub mod engine;
pub mod error;
pub mod key_material;
pub mod logging;
pub mod mnemonic;
pub mod multisig;
pub mod privacy;
pub mod resolver;
pub mod rpc;
pub mod scheduler;
pub mod store;
pub mod types;

pub use backend::{ChainBackend, InMemoryBackend};
pub use config::EngineConfig;
pub use engine::{
    BroadcastOutcome, CosignerInput, MultisigConfig, RefreshReport, WalletEngine, XpubExport,
};
pub use error::WalletError;
pub use multisig::PaymentRequest;
pub use privacy::CancelToken;
pub use types::{Account, AccountId, AccountKind, Chain, PrivacySettings};

pub use chain_btc::{AddressType, BtcNetwork};

//! Bitcoin chain support for the wallet transaction engine.
//!
//! Address rendering for the six supported script types, WIF codec, sorted
//! multisig scripts, weight-based fee estimation, randomized UTXO selection,
//! and PSBT construction, signing and finalization.

pub mod address;
pub mod error;
pub mod multisig;
pub mod network;
pub mod psbt;
pub mod transaction;
pub mod utxo;
pub mod wif;

pub use address::AddressType;
pub use error::BtcError;
pub use network::BtcNetwork;
pub use utxo::Utxo;

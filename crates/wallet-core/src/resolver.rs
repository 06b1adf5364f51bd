//! Which address encodings an imported key can use.
//!
//! A compressed key renders as P2PKH, P2SH-P2WPKH or P2WPKH; an uncompressed
//! key only as P2PKH. Nothing is auto-selected: the caller picks one of the
//! candidates at import and the choice is stored on the account.

use bitcoin::secp256k1::{All, Secp256k1};
use chain_btc::address::single_sig_address;
use chain_btc::wif::WifKey;
use chain_btc::{AddressType, BtcNetwork};
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressCandidate {
    pub address_type: AddressType,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub compressed: bool,
    pub network: BtcNetwork,
    pub candidates: Vec<AddressCandidate>,
    pub recommended: AddressType,
}

impl Resolution {
    /// Fails [`WalletError::IncompatibleAddressType`] unless `chosen` is one
    /// of the candidates.
    pub fn check_choice(&self, chosen: AddressType) -> Result<&AddressCandidate, WalletError> {
        self.candidates
            .iter()
            .find(|c| c.address_type == chosen)
            .ok_or_else(|| WalletError::IncompatibleAddressType {
                address_type: chosen.to_string(),
                reason: if self.compressed {
                    "not a single-key encoding".into()
                } else {
                    "an uncompressed key only supports legacy addresses".into()
                },
            })
    }
}

pub fn resolve_key(key: &WifKey, secp: &Secp256k1<All>) -> Result<Resolution, WalletError> {
    let pubkey = key.public_key(secp)?;
    let types: &[AddressType] = if key.is_compressed() {
        &AddressType::SINGLE_SIG
    } else {
        &[AddressType::Legacy]
    };

    let candidates = types
        .iter()
        .map(|&address_type| {
            single_sig_address(&pubkey, address_type, key.network()).map(|address| {
                AddressCandidate {
                    address_type,
                    address: address.to_string(),
                }
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Resolution {
        compressed: key.is_compressed(),
        network: key.network(),
        candidates,
        recommended: if key.is_compressed() {
            AddressType::NativeSegwit
        } else {
            AddressType::Legacy
        },
    })
}

/// Decodes `wif`, checks it belongs to `network`, and lists its encodings.
pub fn resolve_wif(
    wif: &str,
    network: BtcNetwork,
    secp: &Secp256k1<All>,
) -> Result<Resolution, WalletError> {
    let key = WifKey::decode(wif)?;
    network.ensure_matches(key.network())?;
    resolve_key(&key, secp)
}

//! Receive and change address allocation.
//!
//! Every function here takes the account record by `&mut`, so callers hold
//! the account lock for the whole read-increment-record sequence.

use bitcoin::secp256k1::{All, Secp256k1};
use serde::{Deserialize, Serialize};

use crate::derivation::derive_address;
use crate::error::WalletError;
use crate::types::{AccountRecord, Chain, IssuedAddress};

/// Maximum run of issued-but-unused receive addresses after the last used
/// one. Not configurable.
pub const GAP_LIMIT: u32 = 20;

/// A change destination for one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeAddress {
    pub issued: IssuedAddress,
    /// Change goes back to an address that already holds funds.
    pub privacy_degraded: bool,
    /// The account has no internal chain.
    pub non_hd: bool,
}

/// Unused external addresses issued after the last used one.
pub fn unused_receive_count(record: &AccountRecord) -> u32 {
    let first_unused = record.last_used_external().map_or(0, |i| i + 1);
    record.account.external_index.saturating_sub(first_unused)
}

/// Issues the next receive address.
///
/// Imported accounts always return their sole address. HD and multisig
/// accounts fail [`WalletError::GapLimitExceeded`] once [`GAP_LIMIT`]
/// issued addresses sit unused.
pub fn allocate_receive_address(
    record: &mut AccountRecord,
    secp: &Secp256k1<All>,
) -> Result<IssuedAddress, WalletError> {
    if !record.account.is_hd() {
        return sole_address(record, secp);
    }
    if unused_receive_count(record) >= GAP_LIMIT {
        tracing::warn!(account = record.account.id, "receive gap limit reached");
        return Err(WalletError::GapLimitExceeded { limit: GAP_LIMIT });
    }

    let index = record.account.external_index;
    let issued = derive_address(&record.account, Chain::External, index, secp)?.to_issued();
    record.account.external_index = index + 1;
    Ok(record_issued(record, issued))
}

/// Issues a change address for a transaction being built.
///
/// HD and multisig accounts get a fresh internal address and the internal
/// counter is never handed out twice. Imported accounts get their sole
/// address back, flagged.
pub fn allocate_change(
    record: &mut AccountRecord,
    secp: &Secp256k1<All>,
) -> Result<ChangeAddress, WalletError> {
    if !record.account.is_hd() {
        return Ok(ChangeAddress {
            issued: sole_address(record, secp)?,
            privacy_degraded: true,
            non_hd: true,
        });
    }

    let index = record.account.internal_index;
    let issued = derive_address(&record.account, Chain::Internal, index, secp)?.to_issued();
    record.account.internal_index = index + 1;
    tracing::debug!(account = record.account.id, index, "allocated change address");
    Ok(ChangeAddress {
        issued: record_issued(record, issued),
        privacy_degraded: false,
        non_hd: false,
    })
}

/// Records on-chain activity. Returns whether the address belongs to the
/// account.
pub fn mark_used(record: &mut AccountRecord, address: &str) -> bool {
    match record.addresses.iter_mut().find(|a| a.address == address) {
        Some(issued) => {
            issued.used = true;
            true
        }
        None => false,
    }
}

fn sole_address(
    record: &mut AccountRecord,
    secp: &Secp256k1<All>,
) -> Result<IssuedAddress, WalletError> {
    if let Some(existing) = record.address(Chain::External, 0) {
        return Ok(existing.clone());
    }
    let issued = derive_address(&record.account, Chain::External, 0, secp)?.to_issued();
    record.account.external_index = 1;
    Ok(record_issued(record, issued))
}

fn record_issued(record: &mut AccountRecord, issued: IssuedAddress) -> IssuedAddress {
    match record.address(issued.chain, issued.index) {
        Some(existing) => existing.clone(),
        None => {
            record.addresses.push(issued.clone());
            issued
        }
    }
}

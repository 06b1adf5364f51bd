use std::collections::BTreeMap;

use chain_btc::{AddressType, BtcNetwork, Utxo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AccountId = u32;

/// BIP32 chain within an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Receive addresses.
    External,
    /// Change addresses. Never handed out for receiving.
    Internal,
}

impl Chain {
    pub fn index(self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }
}

/// A participant in a multisig account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cosigner {
    /// Master key fingerprint, 8 hex characters.
    pub fingerprint: String,
    /// Account-level extended public key, normalized to `xpub`/`tpub`.
    pub xpub: String,
    /// Origin path of `xpub` below the master key, e.g. `m/48'/1'/0'/2'`.
    pub derivation_path: String,
    pub nickname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccountKind {
    /// Single-key account derived from the wallet seed.
    HdSingle {
        account_index: u32,
        master_fingerprint: String,
        account_xpub: String,
        derivation_path: String,
    },
    /// One imported private key. No chain code, so no internal chain.
    ImportedSingle {
        /// Hex-encoded public key in the key's own compression.
        public_key: String,
        compressed: bool,
    },
    Multisig {
        required: usize,
        total: usize,
        /// Fixed at creation, in the order they were supplied.
        cosigners: Vec<Cosigner>,
        /// Index into `cosigners` of the key this wallet holds.
        local_cosigner: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub kind: AccountKind,
    pub address_type: AddressType,
    pub network: BtcNetwork,
    /// Next unissued external index.
    pub external_index: u32,
    /// Next unissued internal index. Only ever increases.
    pub internal_index: u32,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Whether addresses come from a chain code.
    pub fn is_hd(&self) -> bool {
        !matches!(self.kind, AccountKind::ImportedSingle { .. })
    }

    /// Signatures needed per input.
    pub fn threshold(&self) -> usize {
        match &self.kind {
            AccountKind::Multisig { required, .. } => *required,
            _ => 1,
        }
    }
}

/// An address the wallet has derived and recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedAddress {
    pub address: String,
    /// Hex-encoded scriptPubKey.
    pub script_pubkey: String,
    pub chain: Chain,
    pub index: u32,
    /// Absent for imported keys.
    pub derivation_path: Option<String>,
    pub used: bool,
}

/// A spendable output owned by an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletUtxo {
    pub utxo: Utxo,
    pub address: String,
    pub chain: Chain,
    pub index: u32,
    /// Txid of the unsigned transaction holding this output, if any.
    pub reserved_by: Option<String>,
}

/// Independently toggleable privacy features. All off reproduces plain
/// behaviour: no amount suggestions, no query delays, immediate broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacySettings {
    pub amount_jitter: bool,
    pub timing_jitter: bool,
    pub broadcast_delay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PsbtState {
    Created,
    PartiallySigned { signatures: usize },
    FullySigned { signatures: usize },
    Finalized,
    Broadcast,
    Discarded,
}

impl PsbtState {
    /// Whether the record still holds its input reservations.
    pub fn is_open(self) -> bool {
        !matches!(self, PsbtState::Broadcast | PsbtState::Discarded)
    }
}

/// A transaction under construction, keyed by its unsigned txid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsbtRecord {
    pub txid: String,
    pub account_id: AccountId,
    /// Base64 PSBT.
    pub psbt: String,
    pub threshold: usize,
    /// Signer fingerprint to whether it has signed every input it can.
    pub signers: BTreeMap<String, bool>,
    pub state: PsbtState,
    /// `txid:vout` keys reserved for this transaction.
    pub reserved: Vec<String>,
    pub change_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingState {
    Scheduled,
    /// Handed to the backend; outcome not yet recorded.
    Broadcasting,
    Broadcast,
    Cancelled,
    Failed,
}

/// A finalized transaction waiting in the delayed-broadcast ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBroadcast {
    /// Unsigned txid of the PSBT; one ledger entry per transaction.
    pub id: String,
    pub account_id: AccountId,
    /// Hex-encoded network transaction.
    pub raw_tx: String,
    pub txid: String,
    /// Unix seconds.
    pub due_at: i64,
    pub state: PendingState,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Everything the store persists for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub account: Account,
    pub addresses: Vec<IssuedAddress>,
    pub utxos: Vec<WalletUtxo>,
}

impl AccountRecord {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            addresses: Vec::new(),
            utxos: Vec::new(),
        }
    }

    pub fn address(&self, chain: Chain, index: u32) -> Option<&IssuedAddress> {
        self.addresses
            .iter()
            .find(|a| a.chain == chain && a.index == index)
    }

    pub fn find_address(&self, address: &str) -> Option<&IssuedAddress> {
        self.addresses.iter().find(|a| a.address == address)
    }

    /// Highest used external index, if any.
    pub fn last_used_external(&self) -> Option<u32> {
        self.addresses
            .iter()
            .filter(|a| a.chain == Chain::External && a.used)
            .map(|a| a.index)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(kind: AccountKind) -> Account {
        Account {
            id: 1,
            name: "test".into(),
            kind,
            address_type: AddressType::NativeSegwit,
            network: BtcNetwork::Testnet,
            external_index: 0,
            internal_index: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn imported_accounts_are_not_hd() {
        let imported = account(AccountKind::ImportedSingle {
            public_key: "02".repeat(33),
            compressed: true,
        });
        assert!(!imported.is_hd());
        assert_eq!(imported.threshold(), 1);
    }

    #[test]
    fn account_kind_is_tagged() {
        let kind = AccountKind::Multisig {
            required: 2,
            total: 3,
            cosigners: vec![],
            local_cosigner: 0,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["kind"], "multisig");
        assert_eq!(account(kind).threshold(), 2);
    }

    #[test]
    fn last_used_external_ignores_change() {
        let mut record = AccountRecord::new(account(AccountKind::ImportedSingle {
            public_key: String::new(),
            compressed: true,
        }));
        for (chain, index, used) in [
            (Chain::External, 0, true),
            (Chain::External, 3, true),
            (Chain::Internal, 9, true),
            (Chain::External, 5, false),
        ] {
            record.addresses.push(IssuedAddress {
                address: format!("{chain:?}{index}"),
                script_pubkey: String::new(),
                chain,
                index,
                derivation_path: None,
                used,
            });
        }
        assert_eq!(record.last_used_external(), Some(3));
        assert!(record.address(Chain::Internal, 9).is_some());
    }

    #[test]
    fn closed_psbt_states() {
        assert!(PsbtState::PartiallySigned { signatures: 1 }.is_open());
        assert!(PsbtState::Finalized.is_open());
        assert!(!PsbtState::Broadcast.is_open());
        assert!(!PsbtState::Discarded.is_open());
    }
}

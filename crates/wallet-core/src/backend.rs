//! Blockchain access.
//!
//! The engine only talks to the network through [`ChainBackend`]. Shipping
//! implementations (Electrum, Esplora, a node RPC) live outside this crate;
//! [`InMemoryBackend`] is a self-contained chain used by tests and demos.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bitcoin::{Address, Transaction};
use chain_btc::address::parse_address;
use chain_btc::{BtcNetwork, Utxo};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

/// What the chain knows about one address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressActivity {
    pub utxos: Vec<Utxo>,
    /// Whether the address ever appeared in a transaction, spent or not.
    pub has_history: bool,
}

#[async_trait]
pub trait ChainBackend: Send + Sync {
    async fn address_activity(&self, address: &str) -> Result<AddressActivity, WalletError>;

    /// Submits a hex-encoded transaction and returns its txid.
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<String, WalletError>;

    /// Whether the network already has `txid`, in the mempool or a block.
    async fn transaction_seen(&self, txid: &str) -> Result<bool, WalletError>;
}

#[derive(Default)]
struct ChainState {
    utxos: BTreeMap<String, Vec<Utxo>>,
    history: BTreeSet<String>,
    seen: BTreeSet<String>,
    broadcasts: Vec<String>,
    fail_next: Option<String>,
    queries: usize,
}

/// A toy chain kept in memory.
///
/// Broadcasting a transaction spends its inputs and credits its outputs
/// with zero confirmations.
pub struct InMemoryBackend {
    network: BtcNetwork,
    state: Mutex<ChainState>,
}

impl InMemoryBackend {
    pub fn new(network: BtcNetwork) -> Self {
        Self {
            network,
            state: Mutex::new(ChainState::default()),
        }
    }

    /// Credits `address` with a new output from a made-up funding
    /// transaction.
    pub fn fund(
        &self,
        address: &str,
        amount_sat: u64,
        confirmations: u32,
    ) -> Result<Utxo, WalletError> {
        let script = parse_address(address, self.network)?.script_pubkey();
        let mut txid = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut txid);
        let utxo = Utxo {
            txid: hex::encode(txid),
            vout: 0,
            amount_sat,
            script_pubkey: script.to_hex_string(),
            confirmations,
        };

        let mut state = self.state.lock();
        state
            .utxos
            .entry(address.to_string())
            .or_default()
            .push(utxo.clone());
        state.history.insert(address.to_string());
        Ok(utxo)
    }

    /// Makes the next broadcast fail with `reason`.
    pub fn fail_next_broadcast(&self, reason: &str) {
        self.state.lock().fail_next = Some(reason.to_string());
    }

    /// Marks `txid` as known to the network without it passing through
    /// `broadcast`.
    pub fn mark_seen(&self, txid: &str) {
        self.state.lock().seen.insert(txid.to_string());
    }

    /// Sets the confirmation count of every unspent output.
    pub fn confirm_all(&self, confirmations: u32) {
        let mut state = self.state.lock();
        for utxo in state.utxos.values_mut().flatten() {
            utxo.confirmations = confirmations;
        }
    }

    /// Raw transactions accepted so far, oldest first.
    pub fn broadcasts(&self) -> Vec<String> {
        self.state.lock().broadcasts.clone()
    }

    pub fn query_count(&self) -> usize {
        self.state.lock().queries
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.state
            .lock()
            .utxos
            .get(address)
            .map_or(0, |utxos| utxos.iter().map(|u| u.amount_sat).sum())
    }

    fn apply(&self, state: &mut ChainState, tx: &Transaction, txid: &str) -> Result<(), WalletError> {
        let mut spent = Vec::with_capacity(tx.input.len());
        for input in &tx.input {
            let key = format!("{}:{}", input.previous_output.txid, input.previous_output.vout);
            let owner = state
                .utxos
                .iter()
                .find(|(_, utxos)| utxos.iter().any(|u| u.outpoint_key() == key))
                .map(|(address, _)| address.clone())
                .ok_or_else(|| {
                    WalletError::Backend(format!("bad-txns-inputs-missingorspent: {key}"))
                })?;
            spent.push((owner, key));
        }
        for (owner, key) in spent {
            if let Some(utxos) = state.utxos.get_mut(&owner) {
                utxos.retain(|u| u.outpoint_key() != key);
            }
        }

        for (vout, output) in tx.output.iter().enumerate() {
            let Ok(address) =
                Address::from_script(&output.script_pubkey, self.network.to_bitcoin_network())
            else {
                continue;
            };
            let address = address.to_string();
            state.utxos.entry(address.clone()).or_default().push(Utxo {
                txid: txid.to_string(),
                vout: vout as u32,
                amount_sat: output.value.to_sat(),
                script_pubkey: output.script_pubkey.to_hex_string(),
                confirmations: 0,
            });
            state.history.insert(address);
        }
        Ok(())
    }
}

#[async_trait]
impl ChainBackend for InMemoryBackend {
    async fn address_activity(&self, address: &str) -> Result<AddressActivity, WalletError> {
        let mut state = self.state.lock();
        state.queries += 1;
        Ok(AddressActivity {
            utxos: state.utxos.get(address).cloned().unwrap_or_default(),
            has_history: state.history.contains(address),
        })
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> Result<String, WalletError> {
        let bytes = hex::decode(raw_tx_hex)
            .map_err(|e| WalletError::Backend(format!("raw transaction hex: {e}")))?;
        let tx: Transaction = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| WalletError::Backend(format!("decode transaction: {e}")))?;
        let txid = tx.compute_txid().to_string();

        let mut state = self.state.lock();
        if let Some(reason) = state.fail_next.take() {
            return Err(WalletError::Backend(reason));
        }
        if state.seen.contains(&txid) {
            return Ok(txid);
        }
        self.apply(&mut state, &tx, &txid)?;
        state.seen.insert(txid.clone());
        state.broadcasts.push(raw_tx_hex.to_string());
        tracing::debug!(%txid, "in-memory backend accepted transaction");
        Ok(txid)
    }

    async fn transaction_seen(&self, txid: &str) -> Result<bool, WalletError> {
        Ok(self.state.lock().seen.contains(txid))
    }
}

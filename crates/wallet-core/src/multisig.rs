//! Transaction coordination: build, sign, merge, finalize.
//!
//! Every spend is a PSBT tracked by its unsigned txid. Single-key accounts
//! go through the same path with a threshold of one.
//!
//! ```text
//! Created -> PartiallySigned(k) -> FullySigned(k >= M) -> Finalized -> Broadcast
//!    \__________________\______________________\______________> Discarded
//! ```
//!
//! Inputs are reserved in the account's UTXO set when a PSBT is built or
//! first seen. Any later operation on a PSBT whose inputs are gone, or held
//! by another PSBT, fails [`WalletError::StaleInputs`].

use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Amount, ScriptBuf, TxOut};
use chain_btc::address::parse_address;
use chain_btc::psbt::{self, PsbtInput, SignOutcome};
use chain_btc::transaction::{base_weight, output_weight, SpendProfile};
use chain_btc::utxo::{select_utxos, SelectionParams};
use chain_btc::Utxo;
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::change::allocate_change;
use crate::config::EngineConfig;
use crate::derivation::derive_address;
use crate::error::WalletError;
use crate::key_material::KeyMaterial;
use crate::store::WalletStore;
use crate::types::{Account, AccountId, AccountKind, AccountRecord, PsbtRecord, PsbtState};

/// Highest fee rate a build accepts, in sat/vB.
pub const MAX_FEE_RATE_SAT_VBYTE: u64 = 10_000;

/// A payment to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub recipient: String,
    pub amount_sat: u64,
    pub fee_rate_sat_vbyte: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltTransaction {
    pub txid: String,
    /// Base64 PSBT.
    pub psbt: String,
    pub amount_sat: u64,
    pub fee_sat: u64,
    pub change_sat: u64,
    pub change_address: Option<String>,
    /// `txid:vout` of every input.
    pub inputs: Vec<String>,
    /// Change returns to an address that already holds funds.
    pub privacy_degraded: bool,
    pub non_hd_change: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub txid: String,
    pub psbt: String,
    pub state: PsbtState,
    /// Cosigner fingerprint to whether it has signed every input it can.
    pub signers: BTreeMap<String, bool>,
    /// Signatures added by this call.
    pub added: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedTransaction {
    /// Unsigned txid, the key of the PSBT record.
    pub id: String,
    /// Network txid; differs from `id` when inputs carry scriptSigs.
    pub txid: String,
    pub raw_tx: String,
    pub psbt: String,
}

fn spend_profile(account: &Account) -> Result<SpendProfile, WalletError> {
    let profile = match &account.kind {
        AccountKind::HdSingle { .. } => SpendProfile::single_sig(account.address_type, true)?,
        AccountKind::ImportedSingle { compressed, .. } => {
            SpendProfile::single_sig(account.address_type, *compressed)?
        }
        AccountKind::Multisig {
            required, total, ..
        } => SpendProfile::multisig(account.address_type, *required, *total)?,
    };
    Ok(profile)
}

/// Builds and reserves an unsigned PSBT paying `request`.
///
/// Selection only sees unreserved outputs with enough confirmations. A
/// change address is allocated only when the selection has change; its
/// index is consumed even if a later step fails.
pub fn build<R: Rng + ?Sized>(
    store: &WalletStore,
    account_id: AccountId,
    request: &PaymentRequest,
    config: &EngineConfig,
    secp: &Secp256k1<All>,
    rng: &mut R,
) -> Result<BuiltTransaction, WalletError> {
    if request.amount_sat < config.dust_threshold_sat {
        return Err(WalletError::InvalidAmount(format!(
            "{} sat is below the dust threshold of {} sat",
            request.amount_sat, config.dust_threshold_sat
        )));
    }
    if request.amount_sat > Amount::MAX_MONEY.to_sat() {
        return Err(WalletError::InvalidAmount(format!(
            "{} sat exceeds the 21 million BTC supply",
            request.amount_sat
        )));
    }
    if request.fee_rate_sat_vbyte == 0 {
        return Err(WalletError::InvalidAmount("fee rate must be positive".into()));
    }
    if request.fee_rate_sat_vbyte > MAX_FEE_RATE_SAT_VBYTE {
        return Err(WalletError::InvalidAmount(format!(
            "fee rate {} sat/vB is above {MAX_FEE_RATE_SAT_VBYTE} sat/vB",
            request.fee_rate_sat_vbyte
        )));
    }
    let recipient_script = parse_address(&request.recipient, store.network())?.script_pubkey();

    let (built, record) = store.with_account(account_id, |record| {
        let built = build_locked(record, request, &recipient_script, config, secp, rng)?;
        Ok((built, record.account.clone()))
    })?;

    store.put_transaction(PsbtRecord {
        txid: built.txid.clone(),
        account_id,
        psbt: built.psbt.clone(),
        threshold: record.threshold(),
        signers: BTreeMap::new(),
        state: PsbtState::Created,
        reserved: built.inputs.clone(),
        change_address: built.change_address.clone(),
        created_at: Utc::now(),
    });
    tracing::info!(
        account = account_id,
        txid = %built.txid,
        inputs = built.inputs.len(),
        fee_sat = built.fee_sat,
        change_sat = built.change_sat,
        "built transaction"
    );
    Ok(built)
}

fn build_locked<R: Rng + ?Sized>(
    record: &mut AccountRecord,
    request: &PaymentRequest,
    recipient_script: &ScriptBuf,
    config: &EngineConfig,
    secp: &Secp256k1<All>,
    rng: &mut R,
) -> Result<BuiltTransaction, WalletError> {
    let profile = spend_profile(&record.account)?;
    let candidates: Vec<Utxo> = record
        .utxos
        .iter()
        .filter(|u| u.reserved_by.is_none() && u.utxo.confirmations >= config.min_confirmations)
        .map(|u| u.utxo.clone())
        .collect();

    let params = SelectionParams {
        target_sat: request.amount_sat,
        fee_rate_sat_vbyte: request.fee_rate_sat_vbyte,
        base_weight: base_weight(profile.has_witness()) + output_weight(recipient_script.len()),
        input_weight: profile.input_weight(),
        change_output_weight: output_weight(record.account.address_type.script_pubkey_len()),
        dust_threshold_sat: config.dust_threshold_sat,
        max_inputs: config.max_inputs,
        max_fee_sat: config.max_fee_sat,
    };
    let selection = select_utxos(&candidates, &params, rng)?;

    let change = if selection.has_change() {
        Some(allocate_change(record, secp)?)
    } else {
        None
    };

    let mut outputs = vec![TxOut {
        value: Amount::from_sat(request.amount_sat),
        script_pubkey: recipient_script.clone(),
    }];
    if let Some(change) = &change {
        let script_pubkey = ScriptBuf::from_hex(&change.issued.script_pubkey)
            .map_err(|e| WalletError::Internal(format!("change script: {e}")))?;
        outputs.push(TxOut {
            value: Amount::from_sat(selection.change_sat),
            script_pubkey,
        });
    }
    outputs.shuffle(rng);

    let mut inputs = Vec::with_capacity(selection.selected.len());
    for utxo in &selection.selected {
        let owner = record
            .utxos
            .iter()
            .find(|w| w.utxo.outpoint_key() == utxo.outpoint_key())
            .ok_or_else(|| WalletError::Internal("selected output is not in the account".into()))?;
        let derived = derive_address(&record.account, owner.chain, owner.index, secp)?;
        inputs.push(PsbtInput {
            utxo: utxo.clone(),
            redeem_script: derived.redeem_script,
            witness_script: derived.witness_script,
            bip32_derivation: derived.key_origins,
        });
    }

    let built = psbt::build_psbt(&inputs, outputs)?;
    let txid = psbt::unsigned_txid(&built);
    let reserved: Vec<String> = selection.selected.iter().map(Utxo::outpoint_key).collect();
    for owned in record.utxos.iter_mut() {
        if reserved.contains(&owned.utxo.outpoint_key()) {
            owned.reserved_by = Some(txid.clone());
        }
    }

    Ok(BuiltTransaction {
        txid,
        psbt: psbt::to_base64(&built),
        amount_sat: request.amount_sat,
        fee_sat: selection.fee_sat,
        change_sat: selection.change_sat,
        privacy_degraded: change.as_ref().is_some_and(|c| c.privacy_degraded),
        non_hd_change: change.as_ref().is_some_and(|c| c.non_hd),
        change_address: change.map(|c| c.issued.address),
        inputs: reserved,
    })
}

/// Adds this wallet's signatures to `encoded`.
///
/// A seed signs every input key whose origin fingerprint is the master
/// fingerprint; an imported key signs every input it can spend. Signing
/// twice adds nothing. A key with nothing to sign fails
/// [`WalletError::ForeignTransaction`].
pub fn sign(
    store: &WalletStore,
    account_id: AccountId,
    encoded: &str,
    key: &KeyMaterial,
    secp: &Secp256k1<All>,
) -> Result<SignedTransaction, WalletError> {
    let incoming = psbt::from_base64(encoded)?;
    let (signed, added) = with_tracked(store, account_id, incoming, secp, |tracked| {
        let mut added = 0;
        let mut relevant = false;
        for index in 0..tracked.psbt.inputs.len() {
            for (secret, compressed) in signing_keys(&tracked.psbt, index, key, secp)? {
                match psbt::sign_input(&mut tracked.psbt, index, &secret, compressed, secp)? {
                    SignOutcome::Signed => {
                        added += 1;
                        relevant = true;
                    }
                    SignOutcome::AlreadySigned => relevant = true,
                    SignOutcome::NotOurs => {}
                }
            }
        }
        if !relevant {
            return Err(WalletError::ForeignTransaction);
        }
        Ok(added)
    })?;

    tracing::info!(
        account = account_id,
        txid = %signed.txid,
        added,
        state = ?signed.state,
        "signed transaction"
    );
    Ok(SignedTransaction { added, ..signed })
}

fn signing_keys(
    psbt: &Psbt,
    index: usize,
    key: &KeyMaterial,
    secp: &Secp256k1<All>,
) -> Result<Vec<(bitcoin::secp256k1::SecretKey, bool)>, WalletError> {
    match key {
        KeyMaterial::Imported(wif) => Ok(vec![(wif.secret_key()?, wif.is_compressed())]),
        KeyMaterial::Seed(seed) => {
            let mut keys = Vec::new();
            for (pubkey, (fingerprint, path)) in &psbt.inputs[index].bip32_derivation {
                if *fingerprint != seed.fingerprint() {
                    continue;
                }
                let secret = seed.secret_at(path, secp)?;
                if bitcoin::secp256k1::PublicKey::from_secret_key(secp, &secret) != *pubkey {
                    tracing::warn!(input = index, %path, "origin path does not produce the listed key");
                    continue;
                }
                keys.push((secret, true));
            }
            Ok(keys)
        }
    }
}

/// Combines two copies of the same PSBT.
pub fn merge(
    store: &WalletStore,
    account_id: AccountId,
    a: &str,
    b: &str,
    secp: &Secp256k1<All>,
) -> Result<SignedTransaction, WalletError> {
    let merged = psbt::merge(psbt::from_base64(a)?, psbt::from_base64(b)?)?;
    let (result, ()) = with_tracked(store, account_id, merged, secp, |_| Ok(()))?;
    tracing::debug!(account = account_id, txid = %result.txid, state = ?result.state, "merged PSBTs");
    Ok(result)
}

/// Builds the final scriptSigs and witnesses and extracts the network
/// transaction. Needs `M` signatures on every input.
pub fn finalize(
    store: &WalletStore,
    account_id: AccountId,
    encoded: &str,
    secp: &Secp256k1<All>,
) -> Result<FinalizedTransaction, WalletError> {
    let incoming = psbt::from_base64(encoded)?;
    let (saved, tx) = with_tracked(store, account_id, incoming, secp, |tracked| {
        psbt::finalize(&mut tracked.psbt, secp)?;
        Ok(psbt::extract_transaction(&tracked.psbt)?)
    })?;

    Ok(FinalizedTransaction {
        id: saved.txid,
        txid: tx.compute_txid().to_string(),
        raw_tx: hex::encode(bitcoin::consensus::serialize(&tx)),
        psbt: saved.psbt,
    })
}

/// Drops an unbroadcast PSBT and frees its inputs.
pub fn discard(store: &WalletStore, account_id: AccountId, txid: &str) -> Result<(), WalletError> {
    let record = store.transaction(txid)?;
    if record.account_id != account_id {
        return Err(WalletError::UnknownTransaction(txid.to_string()));
    }
    if record.state == PsbtState::Broadcast {
        return Err(WalletError::AlreadyBroadcast(txid.to_string()));
    }
    store.release_reservations(account_id, txid)?;
    store.update_transaction(txid, |r| {
        r.state = PsbtState::Discarded;
        Ok(())
    })?;
    tracing::info!(account = account_id, %txid, "discarded transaction");
    Ok(())
}

/// Fails [`WalletError::StaleInputs`] unless every input is an unspent
/// output of the account, free or held by `txid` itself.
pub fn check_inputs(record: &AccountRecord, psbt: &Psbt, txid: &str) -> Result<(), WalletError> {
    let stale: Vec<String> = psbt::spent_outpoints(psbt)
        .into_iter()
        .filter(|key| {
            !record.utxos.iter().any(|owned| {
                owned.utxo.outpoint_key() == *key
                    && owned.reserved_by.as_deref().map_or(true, |holder| holder == txid)
            })
        })
        .collect();
    if stale.is_empty() {
        Ok(())
    } else {
        Err(WalletError::StaleInputs(stale))
    }
}

struct Tracked {
    account_id: AccountId,
    psbt: Psbt,
    txid: String,
    threshold: usize,
    /// The store has no live record, so the inputs still need reserving.
    reopen: bool,
}

/// Loads the tracked copy of `incoming`, lets `update` work on it and
/// stores the result, all under the account lock. Concurrent signers and
/// mergers on one account therefore see each other's signatures.
fn with_tracked<T>(
    store: &WalletStore,
    account_id: AccountId,
    incoming: Psbt,
    secp: &Secp256k1<All>,
    update: impl FnOnce(&mut Tracked) -> Result<T, WalletError>,
) -> Result<(SignedTransaction, T), WalletError> {
    store.with_account(account_id, |record| {
        let mut tracked = track(store, record, incoming, secp)?;
        let output = update(&mut tracked)?;
        if tracked.reopen {
            let inputs = psbt::spent_outpoints(&tracked.psbt);
            for owned in record.utxos.iter_mut() {
                if inputs.contains(&owned.utxo.outpoint_key()) {
                    owned.reserved_by = Some(tracked.txid.clone());
                }
            }
        }
        Ok((save(store, &tracked), output))
    })
}

/// Checks `incoming` against the account and the stored record and merges
/// it into the stored copy. Every partial signature must verify.
fn track(
    store: &WalletStore,
    record: &AccountRecord,
    incoming: Psbt,
    secp: &Secp256k1<All>,
) -> Result<Tracked, WalletError> {
    let account_id = record.account.id;
    let txid = psbt::unsigned_txid(&incoming);
    let existing = store.find_transaction(&txid);
    if let Some(stored) = &existing {
        if stored.account_id != account_id {
            return Err(WalletError::ForeignTransaction);
        }
        if stored.state == PsbtState::Broadcast {
            return Err(WalletError::AlreadyBroadcast(txid));
        }
    }
    check_inputs(record, &incoming, &txid)?;
    psbt::verify_signatures(&incoming, secp)?;

    let live = existing.filter(|r| r.state != PsbtState::Discarded);
    let reopen = live.is_none();
    let psbt = match live {
        Some(stored) => psbt::merge(psbt::from_base64(&stored.psbt)?, incoming)?,
        None => {
            tracing::debug!(account = account_id, %txid, "adopting PSBT");
            incoming
        }
    };
    Ok(Tracked {
        account_id,
        psbt,
        txid,
        threshold: record.account.threshold(),
        reopen,
    })
}

fn save(store: &WalletStore, tracked: &Tracked) -> SignedTransaction {
    let encoded = psbt::to_base64(&tracked.psbt);
    let state = psbt_state(&tracked.psbt, tracked.threshold);
    let signers = signer_status(&tracked.psbt);

    match store.find_transaction(&tracked.txid) {
        Some(mut record) => {
            record.psbt = encoded.clone();
            record.state = state;
            record.signers = signers.clone();
            record.reserved = psbt::spent_outpoints(&tracked.psbt);
            store.put_transaction(record);
        }
        None => store.put_transaction(PsbtRecord {
            txid: tracked.txid.clone(),
            account_id: tracked.account_id,
            psbt: encoded.clone(),
            threshold: tracked.threshold,
            signers: signers.clone(),
            state,
            reserved: psbt::spent_outpoints(&tracked.psbt),
            change_address: None,
            created_at: Utc::now(),
        }),
    }

    SignedTransaction {
        txid: tracked.txid.clone(),
        psbt: encoded,
        state,
        signers,
        added: 0,
    }
}

/// Signatures present on the least-signed input; a final input counts as
/// fully signed.
pub fn signature_count(psbt: &Psbt, threshold: usize) -> usize {
    psbt.inputs
        .iter()
        .map(|input| {
            if psbt::is_input_final(input) {
                threshold
            } else {
                input.partial_sigs.len()
            }
        })
        .min()
        .unwrap_or(0)
}

pub fn psbt_state(psbt: &Psbt, threshold: usize) -> PsbtState {
    if psbt::is_finalized(psbt) {
        return PsbtState::Finalized;
    }
    if psbt.inputs.iter().all(|i| i.partial_sigs.is_empty()) {
        return PsbtState::Created;
    }
    let signatures = signature_count(psbt, threshold);
    if signatures >= threshold {
        PsbtState::FullySigned { signatures }
    } else {
        PsbtState::PartiallySigned { signatures }
    }
}

/// For each origin fingerprint in the PSBT, whether that signer has signed
/// every input listing one of its keys.
pub fn signer_status(psbt: &Psbt) -> BTreeMap<String, bool> {
    let mut status: BTreeMap<String, bool> = BTreeMap::new();
    for input in &psbt.inputs {
        let final_input = psbt::is_input_final(input);
        for (pubkey, (fingerprint, _)) in &input.bip32_derivation {
            let signed = final_input || input.partial_sigs.keys().any(|pk| pk.inner == *pubkey);
            status
                .entry(fingerprint.to_string())
                .and_modify(|all| *all &= signed)
                .or_insert(signed);
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use bitcoin::secp256k1::Secp256k1;
    use chain_btc::{AddressType, BtcNetwork};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::change::allocate_receive_address;
    use crate::derivation::single_sig_account_path;
    use crate::key_material::{format_path, SeedKey};
    use crate::mnemonic::mnemonic_to_seed;
    use crate::types::{PrivacySettings, WalletUtxo};

    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const RECIPIENT: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

    fn setup() -> (WalletStore, SeedKey, Secp256k1<All>) {
        let secp = Secp256k1::new();
        let seed = SeedKey::new(mnemonic_to_seed(ABANDON, "").unwrap(), BtcNetwork::Testnet, &secp).unwrap();
        let store = WalletStore::in_memory(BtcNetwork::Testnet, PrivacySettings::default());
        let path = single_sig_account_path(AddressType::NativeSegwit, BtcNetwork::Testnet, 0).unwrap();
        let account = Account {
            id: 1,
            name: "main".into(),
            kind: AccountKind::HdSingle {
                account_index: 0,
                master_fingerprint: seed.fingerprint().to_string(),
                account_xpub: seed.xpub_at(&path, &secp).unwrap().to_string(),
                derivation_path: format_path(&path),
            },
            address_type: AddressType::NativeSegwit,
            network: BtcNetwork::Testnet,
            external_index: 0,
            internal_index: 0,
            created_at: Utc::now(),
        };
        store.insert_account(|_| Ok(AccountRecord::new(account))).unwrap();
        (store, seed, secp)
    }

    fn fund(store: &WalletStore, secp: &Secp256k1<All>, amounts: &[u64]) {
        store
            .with_account(1, |record| {
                for (n, amount) in amounts.iter().enumerate() {
                    let issued = allocate_receive_address(record, secp)?;
                    record.utxos.push(WalletUtxo {
                        utxo: Utxo {
                            txid: format!("{:064x}", n + 1),
                            vout: 0,
                            amount_sat: *amount,
                            script_pubkey: issued.script_pubkey.clone(),
                            confirmations: 6,
                        },
                        address: issued.address.clone(),
                        chain: issued.chain,
                        index: issued.index,
                        reserved_by: None,
                    });
                }
                Ok(())
            })
            .unwrap();
    }

    fn pay(amount_sat: u64) -> PaymentRequest {
        PaymentRequest {
            recipient: RECIPIENT.into(),
            amount_sat,
            fee_rate_sat_vbyte: 2,
        }
    }

    #[test]
    fn build_sign_finalize_single_sig() {
        let (store, seed, secp) = setup();
        fund(&store, &secp, &[40_000, 70_000]);
        let mut rng = StdRng::seed_from_u64(1);
        let built = build(&store, 1, &pay(90_000), &EngineConfig::default(), &secp, &mut rng).unwrap();
        assert_eq!(built.inputs.len(), 2);
        assert!(built.change_address.is_some());
        assert_eq!(store.transaction(&built.txid).unwrap().state, PsbtState::Created);

        let key = KeyMaterial::Seed(seed);
        let signed = sign(&store, 1, &built.psbt, &key, &secp).unwrap();
        assert_eq!(signed.added, 2);
        assert_eq!(signed.state, PsbtState::FullySigned { signatures: 1 });
        assert_eq!(signed.signers.values().collect::<Vec<_>>(), vec![&true]);

        let again = sign(&store, 1, &signed.psbt, &key, &secp).unwrap();
        assert_eq!(again.added, 0);

        let finalized = finalize(&store, 1, &signed.psbt, &secp).unwrap();
        assert_eq!(finalized.id, built.txid);
        assert_eq!(finalized.txid, built.txid);
        assert_eq!(store.transaction(&built.txid).unwrap().state, PsbtState::Finalized);
    }

    #[test]
    fn reserved_outputs_are_not_selected_twice() {
        let (store, _, secp) = setup();
        fund(&store, &secp, &[50_000, 50_000]);
        let mut rng = StdRng::seed_from_u64(2);
        let first = build(&store, 1, &pay(20_000), &EngineConfig::default(), &secp, &mut rng).unwrap();
        let second = build(&store, 1, &pay(20_000), &EngineConfig::default(), &secp, &mut rng).unwrap();
        assert!(first.inputs.iter().all(|i| !second.inputs.contains(i)));
        let err = build(&store, 1, &pay(20_000), &EngineConfig::default(), &secp, &mut rng).unwrap_err();
        assert_eq!(err.kind(), "insufficient_funds");

        discard(&store, 1, &first.txid).unwrap();
        assert!(build(&store, 1, &pay(20_000), &EngineConfig::default(), &secp, &mut rng).is_ok());
    }

    #[test]
    fn spent_inputs_make_the_psbt_stale() {
        let (store, seed, secp) = setup();
        fund(&store, &secp, &[50_000]);
        let mut rng = StdRng::seed_from_u64(3);
        let built = build(&store, 1, &pay(20_000), &EngineConfig::default(), &secp, &mut rng).unwrap();
        store.with_account(1, |r| {
            r.utxos.clear();
            Ok(())
        }).unwrap();
        let err = sign(&store, 1, &built.psbt, &KeyMaterial::Seed(seed), &secp).unwrap_err();
        assert!(matches!(err, WalletError::StaleInputs(ref keys) if keys == &built.inputs));
    }

    #[test]
    fn finalize_without_signatures_fails_threshold() {
        let (store, _, secp) = setup();
        fund(&store, &secp, &[50_000]);
        let mut rng = StdRng::seed_from_u64(4);
        let built = build(&store, 1, &pay(20_000), &EngineConfig::default(), &secp, &mut rng).unwrap();
        let err = finalize(&store, 1, &built.psbt, &secp).unwrap_err();
        assert_eq!(err.kind(), "threshold_not_met");
    }

    #[test]
    fn unrelated_key_is_foreign() {
        let (store, _, secp) = setup();
        fund(&store, &secp, &[50_000]);
        let mut rng = StdRng::seed_from_u64(5);
        let built = build(&store, 1, &pay(20_000), &EngineConfig::default(), &secp, &mut rng).unwrap();
        let other = KeyMaterial::Seed(SeedKey::new(zeroize::Zeroizing::new([3u8; 64]), BtcNetwork::Testnet, &secp).unwrap());
        assert_eq!(sign(&store, 1, &built.psbt, &other, &secp).unwrap_err().kind(), "foreign_transaction");
    }

    #[test]
    fn out_of_range_requests_are_rejected() {
        let (store, _, secp) = setup();
        fund(&store, &secp, &[50_000]);
        let mut rng = StdRng::seed_from_u64(6);
        let config = EngineConfig::default();
        assert_eq!(build(&store, 1, &pay(100), &config, &secp, &mut rng).unwrap_err().kind(), "invalid_amount");
        let mut zero_fee = pay(20_000);
        zero_fee.fee_rate_sat_vbyte = 0;
        assert!(build(&store, 1, &zero_fee, &config, &secp, &mut rng).is_err());
        let mut absurd_rate = pay(20_000);
        absurd_rate.fee_rate_sat_vbyte = u64::MAX / 2;
        assert_eq!(build(&store, 1, &absurd_rate, &config, &secp, &mut rng).unwrap_err().kind(), "invalid_amount");
        assert_eq!(build(&store, 1, &pay(u64::MAX), &config, &secp, &mut rng).unwrap_err().kind(), "invalid_amount");
        assert_eq!(
            build(&store, 1, &pay(Amount::MAX_MONEY.to_sat() + 1), &config, &secp, &mut rng).unwrap_err().kind(),
            "invalid_amount"
        );
        let mut mainnet = pay(20_000);
        mainnet.recipient = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".into();
        assert!(build(&store, 1, &mainnet, &config, &secp, &mut rng).is_err());
    }

    #[test]
    fn unconfirmed_outputs_wait_for_confirmations() {
        let (store, _, secp) = setup();
        fund(&store, &secp, &[50_000]);
        store.with_account(1, |r| {
            r.utxos[0].utxo.confirmations = 0;
            Ok(())
        }).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let err = build(&store, 1, &pay(20_000), &EngineConfig::default(), &secp, &mut rng).unwrap_err();
        assert_eq!(err.kind(), "insufficient_funds");
    }
}

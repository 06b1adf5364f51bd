//! PSBT (BIP174) construction, signing, merging and finalization.
//!
//! Every spend, single-sig or multisig, goes through a PSBT. Each input
//! carries its previous output in `witness_utxo`, including legacy inputs:
//! this wallet signs from its own UTXO records and never needs the full
//! previous transaction.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bitcoin::bip32::KeySource;
use bitcoin::hashes::Hash;
use bitcoin::psbt::{Input, Psbt};
use bitcoin::script::{Builder, PushBytesBuf, Script, ScriptBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey, Verification};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{ecdsa, CompressedPublicKey, PublicKey, Transaction, TxOut, Witness};

use crate::error::BtcError;
use crate::multisig::parse_multisig_script;
use crate::transaction::unsigned_transaction;
use crate::utxo::Utxo;

/// One input to place in a new PSBT, with everything a signer needs.
#[derive(Debug, Clone)]
pub struct PsbtInput {
    pub utxo: Utxo,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
    pub bip32_derivation: BTreeMap<bitcoin::secp256k1::PublicKey, KeySource>,
}

/// Result of offering a key to one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutcome {
    Signed,
    /// A signature from this key is already present, or the input is final.
    AlreadySigned,
    /// The key cannot spend this input.
    NotOurs,
}

/// How an input is unlocked, derived from its previous output and scripts.
enum Spend {
    P2pkh,
    P2wpkh,
    P2shP2wpkh(ScriptBuf),
    P2wsh(ScriptBuf),
    P2shP2wsh { redeem: ScriptBuf, witness: ScriptBuf },
    P2sh(ScriptBuf),
}

/// Builds an unsigned PSBT from annotated inputs and final outputs.
pub fn build_psbt(inputs: &[PsbtInput], outputs: Vec<TxOut>) -> Result<Psbt, BtcError> {
    let outpoints = inputs
        .iter()
        .map(|i| i.utxo.outpoint())
        .collect::<Result<Vec<_>, _>>()?;
    let tx = unsigned_transaction(&outpoints, outputs);

    let mut psbt = Psbt::from_unsigned_tx(tx)
        .map_err(|e| BtcError::TransactionBuildError(format!("psbt from unsigned tx: {e}")))?;

    for (slot, input) in psbt.inputs.iter_mut().zip(inputs) {
        slot.witness_utxo = Some(input.utxo.tx_out()?);
        slot.redeem_script = input.redeem_script.clone();
        slot.witness_script = input.witness_script.clone();
        slot.bip32_derivation = input.bip32_derivation.clone();
        slot.sighash_type = Some(EcdsaSighashType::All.into());
    }
    Ok(psbt)
}

pub fn to_base64(psbt: &Psbt) -> String {
    BASE64.encode(psbt.serialize())
}

pub fn from_base64(encoded: &str) -> Result<Psbt, BtcError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| BtcError::InvalidPsbt(format!("base64: {e}")))?;
    Psbt::deserialize(&bytes).map_err(|e| BtcError::InvalidPsbt(e.to_string()))
}

/// Txid of the unsigned transaction. Stable across signing, so it
/// identifies the PSBT through its whole lifecycle.
pub fn unsigned_txid(psbt: &Psbt) -> String {
    psbt.unsigned_tx.compute_txid().to_string()
}

/// Outpoint keys (`txid:vout`) spent by the PSBT.
pub fn spent_outpoints(psbt: &Psbt) -> Vec<String> {
    psbt.unsigned_tx
        .input
        .iter()
        .map(|i| format!("{}:{}", i.previous_output.txid, i.previous_output.vout))
        .collect()
}

pub fn is_input_final(input: &Input) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

pub fn is_finalized(psbt: &Psbt) -> bool {
    !psbt.inputs.is_empty() && psbt.inputs.iter().all(is_input_final)
}

fn classify(input: &Input) -> Result<(TxOut, Spend), BtcError> {
    let prevout = input
        .witness_utxo
        .clone()
        .ok_or_else(|| BtcError::InvalidPsbt("input has no witness_utxo".into()))?;
    let spk = &prevout.script_pubkey;

    let spend = if spk.is_p2wpkh() {
        Spend::P2wpkh
    } else if spk.is_p2pkh() {
        Spend::P2pkh
    } else if spk.is_p2wsh() {
        let ws = required_script(&input.witness_script, "witness_script")?;
        if ScriptBuf::new_p2wsh(&ws.wscript_hash()) != *spk {
            return Err(BtcError::InvalidPsbt("witness_script does not match output".into()));
        }
        Spend::P2wsh(ws)
    } else if spk.is_p2sh() {
        let redeem = required_script(&input.redeem_script, "redeem_script")?;
        if ScriptBuf::new_p2sh(&redeem.script_hash()) != *spk {
            return Err(BtcError::InvalidPsbt("redeem_script does not match output".into()));
        }
        if redeem.is_p2wpkh() {
            Spend::P2shP2wpkh(redeem)
        } else if redeem.is_p2wsh() {
            let witness = required_script(&input.witness_script, "witness_script")?;
            if ScriptBuf::new_p2wsh(&witness.wscript_hash()) != redeem {
                return Err(BtcError::InvalidPsbt(
                    "witness_script does not match redeem_script".into(),
                ));
            }
            Spend::P2shP2wsh { redeem, witness }
        } else {
            Spend::P2sh(redeem)
        }
    } else {
        return Err(BtcError::InvalidPsbt(format!(
            "unsupported output script {}",
            spk.to_hex_string()
        )));
    };
    Ok((prevout, spend))
}

fn required_script(script: &Option<ScriptBuf>, field: &str) -> Result<ScriptBuf, BtcError> {
    script
        .clone()
        .ok_or_else(|| BtcError::InvalidPsbt(format!("input is missing {field}")))
}

fn p2wpkh_script(pubkey: &PublicKey) -> Option<ScriptBuf> {
    pubkey
        .compressed
        .then(|| ScriptBuf::new_p2wpkh(&CompressedPublicKey(pubkey.inner).wpubkey_hash()))
}

fn multisig_has_key(script: &Script, pubkey: &PublicKey) -> Result<bool, BtcError> {
    let (_, keys) = parse_multisig_script(script)?;
    Ok(keys.contains(pubkey))
}

/// Whether `pubkey` is one of the keys that unlock the input.
fn key_can_spend(spend: &Spend, prevout: &TxOut, pubkey: &PublicKey) -> Result<bool, BtcError> {
    Ok(match spend {
        Spend::P2pkh => prevout.script_pubkey == ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()),
        Spend::P2wpkh => p2wpkh_script(pubkey).as_ref() == Some(&prevout.script_pubkey),
        Spend::P2shP2wpkh(redeem) => p2wpkh_script(pubkey).as_ref() == Some(redeem),
        Spend::P2wsh(ws) | Spend::P2shP2wsh { witness: ws, .. } => multisig_has_key(ws, pubkey)?,
        Spend::P2sh(redeem) => multisig_has_key(redeem, pubkey)?,
    })
}

/// SIGHASH_ALL message for input `index`.
fn signature_message(
    tx: &Transaction,
    index: usize,
    prevout: &TxOut,
    spend: &Spend,
) -> Result<Message, BtcError> {
    let sighash_err = |e: String| BtcError::SigningError(format!("sighash computation failed: {e}"));
    let mut cache = SighashCache::new(tx);
    let digest: [u8; 32] = match spend {
        Spend::P2wpkh => cache
            .p2wpkh_signature_hash(index, &prevout.script_pubkey, prevout.value, EcdsaSighashType::All)
            .map_err(|e| sighash_err(e.to_string()))?
            .to_byte_array(),
        Spend::P2shP2wpkh(redeem) => cache
            .p2wpkh_signature_hash(index, redeem, prevout.value, EcdsaSighashType::All)
            .map_err(|e| sighash_err(e.to_string()))?
            .to_byte_array(),
        Spend::P2wsh(ws) | Spend::P2shP2wsh { witness: ws, .. } => cache
            .p2wsh_signature_hash(index, ws, prevout.value, EcdsaSighashType::All)
            .map_err(|e| sighash_err(e.to_string()))?
            .to_byte_array(),
        Spend::P2pkh => cache
            .legacy_signature_hash(index, &prevout.script_pubkey, EcdsaSighashType::All.to_u32())
            .map_err(|e| sighash_err(e.to_string()))?
            .to_byte_array(),
        Spend::P2sh(redeem) => cache
            .legacy_signature_hash(index, redeem, EcdsaSighashType::All.to_u32())
            .map_err(|e| sighash_err(e.to_string()))?
            .to_byte_array(),
    };
    Ok(Message::from_digest(digest))
}

/// Checks every partial signature: it must come from a key that can spend
/// its input, use SIGHASH_ALL, and verify against the input's sighash.
/// Final inputs are skipped.
pub fn verify_signatures<C: Verification>(psbt: &Psbt, secp: &Secp256k1<C>) -> Result<(), BtcError> {
    for (index, input) in psbt.inputs.iter().enumerate() {
        if input.partial_sigs.is_empty() || is_input_final(input) {
            continue;
        }
        let (prevout, spend) = classify(input)?;
        let msg = signature_message(&psbt.unsigned_tx, index, &prevout, &spend)?;
        for (pubkey, sig) in &input.partial_sigs {
            if !key_can_spend(&spend, &prevout, pubkey)? {
                return Err(BtcError::InvalidSignature(format!(
                    "input {index}: key {pubkey} cannot spend it"
                )));
            }
            if sig.sighash_type != EcdsaSighashType::All {
                return Err(BtcError::InvalidSignature(format!(
                    "input {index}: {} is not SIGHASH_ALL",
                    sig.sighash_type
                )));
            }
            secp.verify_ecdsa(&msg, &sig.signature, &pubkey.inner)
                .map_err(|_| {
                    BtcError::InvalidSignature(format!("input {index}: signature by {pubkey} does not verify"))
                })?;
        }
    }
    Ok(())
}

/// Signs input `index` with `secret`, if that key can spend it.
///
/// Idempotent: a key that already signed the input is not asked again.
pub fn sign_input(
    psbt: &mut Psbt,
    index: usize,
    secret: &SecretKey,
    compressed: bool,
    secp: &Secp256k1<All>,
) -> Result<SignOutcome, BtcError> {
    let inner = bitcoin::secp256k1::PublicKey::from_secret_key(secp, secret);
    let pubkey = if compressed {
        PublicKey::new(inner)
    } else {
        PublicKey::new_uncompressed(inner)
    };

    let input = psbt
        .inputs
        .get(index)
        .ok_or_else(|| BtcError::SigningError(format!("no input at index {index}")))?;
    if is_input_final(input) || input.partial_sigs.contains_key(&pubkey) {
        return Ok(SignOutcome::AlreadySigned);
    }
    let (prevout, spend) = classify(input)?;

    if !key_can_spend(&spend, &prevout, &pubkey)? {
        return Ok(SignOutcome::NotOurs);
    }

    let msg = signature_message(&psbt.unsigned_tx, index, &prevout, &spend)?;
    let signature = secp.sign_ecdsa(&msg, secret);
    psbt.inputs[index].partial_sigs.insert(
        pubkey,
        ecdsa::Signature {
            signature,
            sighash_type: EcdsaSighashType::All,
        },
    );
    Ok(SignOutcome::Signed)
}

/// Combines the signatures of two PSBTs over the same unsigned transaction.
pub fn merge(mut a: Psbt, b: Psbt) -> Result<Psbt, BtcError> {
    if a.unsigned_tx.compute_txid() != b.unsigned_tx.compute_txid() {
        return Err(BtcError::UnsignedTxMismatch);
    }
    a.combine(b)
        .map_err(|e| BtcError::InvalidPsbt(format!("combine failed: {e}")))?;
    Ok(a)
}

fn push_bytes(builder: Builder, bytes: Vec<u8>) -> Result<Builder, BtcError> {
    let push = PushBytesBuf::try_from(bytes)
        .map_err(|e| BtcError::TransactionBuildError(format!("push too large: {e}")))?;
    Ok(builder.push_slice(push))
}

/// The signature from the key the output commits to.
fn single_signature(
    input: &Input,
    prevout: &TxOut,
    spend: &Spend,
) -> Result<(PublicKey, ecdsa::Signature), BtcError> {
    for (pk, sig) in &input.partial_sigs {
        if key_can_spend(spend, prevout, pk)? {
            return Ok((*pk, *sig));
        }
    }
    Err(BtcError::InsufficientSignatures { have: 0, need: 1 })
}

/// Signatures for a multisig script, in the script's key order, truncated
/// to the threshold.
fn ordered_multisig_signatures(input: &Input, script: &Script) -> Result<Vec<Vec<u8>>, BtcError> {
    let (required, keys) = parse_multisig_script(script)?;
    let sigs: Vec<Vec<u8>> = keys
        .iter()
        .filter_map(|key| input.partial_sigs.get(key))
        .take(required)
        .map(|sig| sig.to_vec())
        .collect();
    if sigs.len() < required {
        return Err(BtcError::InsufficientSignatures {
            have: sigs.len(),
            need: required,
        });
    }
    Ok(sigs)
}

fn multisig_witness(sigs: Vec<Vec<u8>>, script: &Script) -> Witness {
    let mut witness = Witness::new();
    witness.push(Vec::<u8>::new());
    for sig in sigs {
        witness.push(sig);
    }
    witness.push(script.as_bytes());
    witness
}

/// Fills `final_script_sig` / `final_script_witness` on every input and
/// drops the signing metadata. Every partial signature must pass
/// [`verify_signatures`] first.
pub fn finalize<C: Verification>(psbt: &mut Psbt, secp: &Secp256k1<C>) -> Result<(), BtcError> {
    verify_signatures(psbt, secp)?;
    for index in 0..psbt.inputs.len() {
        if is_input_final(&psbt.inputs[index]) {
            continue;
        }
        let (prevout, spend) = classify(&psbt.inputs[index])?;
        let input = &mut psbt.inputs[index];

        match spend {
            Spend::P2wpkh => {
                let (pk, sig) = single_signature(input, &prevout, &spend)?;
                let mut witness = Witness::new();
                witness.push(sig.to_vec());
                witness.push(pk.to_bytes());
                input.final_script_witness = Some(witness);
            }
            Spend::P2shP2wpkh(ref redeem) => {
                let (pk, sig) = single_signature(input, &prevout, &spend)?;
                let mut witness = Witness::new();
                witness.push(sig.to_vec());
                witness.push(pk.to_bytes());
                input.final_script_witness = Some(witness);
                input.final_script_sig =
                    Some(push_bytes(Builder::new(), redeem.to_bytes())?.into_script());
            }
            Spend::P2pkh => {
                let (pk, sig) = single_signature(input, &prevout, &spend)?;
                let builder = push_bytes(Builder::new(), sig.to_vec())?;
                input.final_script_sig = Some(push_bytes(builder, pk.to_bytes())?.into_script());
            }
            Spend::P2wsh(ws) => {
                let sigs = ordered_multisig_signatures(input, &ws)?;
                input.final_script_witness = Some(multisig_witness(sigs, &ws));
            }
            Spend::P2shP2wsh { redeem, witness } => {
                let sigs = ordered_multisig_signatures(input, &witness)?;
                input.final_script_witness = Some(multisig_witness(sigs, &witness));
                input.final_script_sig =
                    Some(push_bytes(Builder::new(), redeem.to_bytes())?.into_script());
            }
            Spend::P2sh(redeem) => {
                let sigs = ordered_multisig_signatures(input, &redeem)?;
                let mut builder = Builder::new().push_int(0);
                for sig in sigs {
                    builder = push_bytes(builder, sig)?;
                }
                builder = push_bytes(builder, redeem.to_bytes())?;
                input.final_script_sig = Some(builder.into_script());
            }
        }

        input.partial_sigs.clear();
        input.bip32_derivation.clear();
        input.redeem_script = None;
        input.witness_script = None;
        input.sighash_type = None;
    }
    Ok(())
}

/// The network-ready transaction from a finalized PSBT.
pub fn extract_transaction(psbt: &Psbt) -> Result<Transaction, BtcError> {
    if !is_finalized(psbt) {
        return Err(BtcError::InvalidPsbt("PSBT is not finalized".into()));
    }
    let mut tx = psbt.unsigned_tx.clone();
    for (txin, input) in tx.input.iter_mut().zip(&psbt.inputs) {
        txin.script_sig = input.final_script_sig.clone().unwrap_or_default();
        txin.witness = input.final_script_witness.clone().unwrap_or_default();
    }
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressType;
    use crate::multisig::{multisig_address, sorted_multisig_script};
    use crate::network::BtcNetwork;
    use crate::transaction::{base_weight, output_weight, SpendProfile};
    use bitcoin::Amount;

    fn secret(n: u8) -> SecretKey {
        SecretKey::from_slice(&[n; 32]).unwrap()
    }

    fn compressed(secp: &Secp256k1<All>, n: u8) -> CompressedPublicKey {
        CompressedPublicKey(bitcoin::secp256k1::PublicKey::from_secret_key(secp, &secret(n)))
    }

    fn funding(spk: &Script, amount_sat: u64, n: u8) -> Utxo {
        Utxo {
            txid: hex::encode([n; 32]),
            vout: 0,
            amount_sat,
            script_pubkey: spk.to_hex_string(),
            confirmations: 3,
        }
    }

    fn pay_out() -> Vec<TxOut> {
        vec![TxOut {
            value: Amount::from_sat(90_000),
            script_pubkey: ScriptBuf::new_p2wpkh(&compressed(&Secp256k1::new(), 99).wpubkey_hash()),
        }]
    }

    fn multisig_psbt(address_type: AddressType) -> (Psbt, ScriptBuf) {
        let secp = Secp256k1::new();
        let keys: Vec<_> = (1..=3).map(|n| compressed(&secp, n)).collect();
        let script = sorted_multisig_script(2, &keys).unwrap();
        let address = multisig_address(&script, address_type, BtcNetwork::Testnet).unwrap();

        let (redeem, witness) = match address_type {
            AddressType::P2wsh => (None, Some(script.clone())),
            AddressType::P2shP2wsh => (
                Some(ScriptBuf::new_p2wsh(&script.wscript_hash())),
                Some(script.clone()),
            ),
            _ => (Some(script.clone()), None),
        };
        let input = PsbtInput {
            utxo: funding(&address.script_pubkey(), 100_000, 7),
            redeem_script: redeem,
            witness_script: witness,
            bip32_derivation: BTreeMap::new(),
        };
        (build_psbt(&[input], pay_out()).unwrap(), script)
    }

    /// Checks each multisig signature against the recomputed sighash.
    fn verify_multisig_witness(tx: &Transaction, prevout_value: u64, script: &Script) -> usize {
        let secp = Secp256k1::new();
        let (_, keys) = parse_multisig_script(script).unwrap();
        let mut cache = SighashCache::new(tx);
        let sighash = cache
            .p2wsh_signature_hash(0, script, Amount::from_sat(prevout_value), EcdsaSighashType::All)
            .unwrap();
        let msg = Message::from_digest(sighash.to_byte_array());

        let items: Vec<Vec<u8>> = tx.input[0].witness.iter().map(|i| i.to_vec()).collect();
        assert!(items[0].is_empty(), "dummy element must be empty");
        let sigs = &items[1..items.len() - 1];

        let mut key_iter = keys.iter();
        let mut verified = 0;
        for raw in sigs {
            let sig = ecdsa::Signature::from_slice(raw).unwrap();
            // Signatures must appear in script key order.
            let matched = key_iter
                .by_ref()
                .any(|k| secp.verify_ecdsa(&msg, &sig.signature, &k.inner).is_ok());
            assert!(matched, "signature out of order or invalid");
            verified += 1;
        }
        verified
    }

    #[test]
    fn two_of_three_finalizes_with_two_signatures() {
        let secp = Secp256k1::new();
        let (mut psbt, script) = multisig_psbt(AddressType::P2wsh);

        assert_eq!(sign_input(&mut psbt, 0, &secret(3), true, &secp).unwrap(), SignOutcome::Signed);
        assert!(matches!(
            finalize(&mut psbt.clone(), &secp),
            Err(BtcError::InsufficientSignatures { have: 1, need: 2 })
        ));
        assert_eq!(sign_input(&mut psbt, 0, &secret(1), true, &secp).unwrap(), SignOutcome::Signed);

        finalize(&mut psbt, &secp).unwrap();
        let tx = extract_transaction(&psbt).unwrap();
        assert_eq!(verify_multisig_witness(&tx, 100_000, &script), 2);

        let estimated = base_weight(true)
            + SpendProfile::multisig(AddressType::P2wsh, 2, 3).unwrap().input_weight()
            + output_weight(22);
        assert!(tx.weight().to_wu() <= estimated);
    }

    #[test]
    fn third_signature_is_not_included() {
        let secp = Secp256k1::new();
        let (mut psbt, script) = multisig_psbt(AddressType::P2wsh);
        for n in 1..=3 {
            sign_input(&mut psbt, 0, &secret(n), true, &secp).unwrap();
        }
        finalize(&mut psbt, &secp).unwrap();
        let tx = extract_transaction(&psbt).unwrap();
        assert_eq!(tx.input[0].witness.len(), 4);
        assert_eq!(verify_multisig_witness(&tx, 100_000, &script), 2);
    }

    #[test]
    fn signing_is_idempotent() {
        let secp = Secp256k1::new();
        let (mut psbt, _) = multisig_psbt(AddressType::P2shP2wsh);
        sign_input(&mut psbt, 0, &secret(2), true, &secp).unwrap();
        let once = psbt.clone();
        assert_eq!(
            sign_input(&mut psbt, 0, &secret(2), true, &secp).unwrap(),
            SignOutcome::AlreadySigned
        );
        assert_eq!(psbt, once);
    }

    #[test]
    fn outsider_key_is_not_ours() {
        let secp = Secp256k1::new();
        let (mut psbt, _) = multisig_psbt(AddressType::P2wsh);
        assert_eq!(sign_input(&mut psbt, 0, &secret(42), true, &secp).unwrap(), SignOutcome::NotOurs);
        assert!(psbt.inputs[0].partial_sigs.is_empty());
    }

    #[test]
    fn nested_and_legacy_multisig_finalize() {
        let secp = Secp256k1::new();
        for ty in [AddressType::P2shP2wsh, AddressType::P2sh] {
            let (mut psbt, _) = multisig_psbt(ty);
            sign_input(&mut psbt, 0, &secret(1), true, &secp).unwrap();
            sign_input(&mut psbt, 0, &secret(2), true, &secp).unwrap();
            finalize(&mut psbt, &secp).unwrap();
            let tx = extract_transaction(&psbt).unwrap();
            assert!(!tx.input[0].script_sig.is_empty(), "{ty}");
            assert_eq!(tx.input[0].witness.is_empty(), ty == AddressType::P2sh, "{ty}");

            let estimated = base_weight(ty.is_segwit())
                + SpendProfile::multisig(ty, 2, 3).unwrap().input_weight()
                + output_weight(22);
            assert!(tx.weight().to_wu() <= estimated, "{ty}");
        }
    }

    #[test]
    fn single_sig_types_sign_and_finalize() {
        let secp = Secp256k1::new();
        let pk = PublicKey::new(compressed(&secp, 5).0);
        for ty in AddressType::SINGLE_SIG {
            let address = crate::address::single_sig_address(&pk, ty, BtcNetwork::Testnet).unwrap();
            let redeem = (ty == AddressType::Segwit)
                .then(|| ScriptBuf::new_p2wpkh(&compressed(&secp, 5).wpubkey_hash()));
            let input = PsbtInput {
                utxo: funding(&address.script_pubkey(), 100_000, 8),
                redeem_script: redeem,
                witness_script: None,
                bip32_derivation: BTreeMap::new(),
            };
            let mut psbt = build_psbt(&[input], pay_out()).unwrap();
            assert_eq!(
                sign_input(&mut psbt, 0, &secret(6), true, &secp).unwrap(),
                SignOutcome::NotOurs
            );
            assert_eq!(sign_input(&mut psbt, 0, &secret(5), true, &secp).unwrap(), SignOutcome::Signed);
            finalize(&mut psbt, &secp).unwrap();
            let tx = extract_transaction(&psbt).unwrap();

            let estimated = base_weight(ty.is_segwit())
                + SpendProfile::single_sig(ty, true).unwrap().input_weight()
                + output_weight(22);
            assert!(tx.weight().to_wu() <= estimated, "{ty}");
        }
    }

    /// A well-formed signature from `signer` over some other message.
    fn signature_over(secp: &Secp256k1<All>, signer: u8, message: [u8; 32]) -> ecdsa::Signature {
        ecdsa::Signature {
            signature: secp.sign_ecdsa(&Message::from_digest(message), &secret(signer)),
            sighash_type: EcdsaSighashType::All,
        }
    }

    #[test]
    fn signatures_over_the_wrong_message_do_not_finalize() {
        let secp = Secp256k1::new();
        let (mut psbt, _) = multisig_psbt(AddressType::P2wsh);
        for signer in [1, 2] {
            psbt.inputs[0].partial_sigs.insert(
                PublicKey::new(compressed(&secp, signer).0),
                signature_over(&secp, signer, [0xab; 32]),
            );
        }
        assert!(matches!(verify_signatures(&psbt, &secp), Err(BtcError::InvalidSignature(_))));
        assert!(matches!(finalize(&mut psbt, &secp), Err(BtcError::InvalidSignature(_))));
        assert!(!is_finalized(&psbt));
    }

    #[test]
    fn signatures_from_outside_the_script_are_rejected() {
        let secp = Secp256k1::new();
        let (mut psbt, _) = multisig_psbt(AddressType::P2wsh);
        sign_input(&mut psbt, 0, &secret(1), true, &secp).unwrap();
        let mut outsider = psbt.clone();
        outsider.inputs[0].partial_sigs.insert(
            PublicKey::new(compressed(&secp, 42).0),
            signature_over(&secp, 42, [1; 32]),
        );
        assert!(verify_signatures(&psbt, &secp).is_ok());
        assert!(matches!(verify_signatures(&outsider, &secp), Err(BtcError::InvalidSignature(_))));
    }

    #[test]
    fn single_key_spend_uses_the_committed_key() {
        let secp = Secp256k1::new();
        let owner = compressed(&secp, 5);
        let input = PsbtInput {
            utxo: funding(&ScriptBuf::new_p2wpkh(&owner.wpubkey_hash()), 100_000, 9),
            redeem_script: None,
            witness_script: None,
            bip32_derivation: BTreeMap::new(),
        };
        let mut psbt = build_psbt(&[input], pay_out()).unwrap();
        sign_input(&mut psbt, 0, &secret(5), true, &secp).unwrap();
        let (pk, sig) = single_signature(
            &psbt.inputs[0],
            psbt.inputs[0].witness_utxo.as_ref().unwrap(),
            &Spend::P2wpkh,
        )
        .unwrap();
        assert_eq!(pk, PublicKey::new(owner.0));
        assert_eq!(sig, psbt.inputs[0].partial_sigs[&pk]);

        // A stray entry from another key is never picked.
        let mut stray = psbt.inputs[0].clone();
        stray.partial_sigs.insert(
            PublicKey::new(compressed(&secp, 1).0),
            signature_over(&secp, 1, [2; 32]),
        );
        let (picked, _) = single_signature(&stray, stray.witness_utxo.as_ref().unwrap(), &Spend::P2wpkh).unwrap();
        assert_eq!(picked, PublicKey::new(owner.0));
    }

    #[test]
    fn merge_unions_signatures() {
        let secp = Secp256k1::new();
        let (base, _) = multisig_psbt(AddressType::P2wsh);
        let mut a = base.clone();
        let mut b = base.clone();
        sign_input(&mut a, 0, &secret(1), true, &secp).unwrap();
        sign_input(&mut b, 0, &secret(2), true, &secp).unwrap();

        let merged = merge(a, b).unwrap();
        assert_eq!(merged.inputs[0].partial_sigs.len(), 2);
    }

    #[test]
    fn merge_rejects_foreign_transaction() {
        let (a, _) = multisig_psbt(AddressType::P2wsh);
        let (b, _) = multisig_psbt(AddressType::P2shP2wsh);
        assert!(matches!(merge(a, b), Err(BtcError::UnsignedTxMismatch)));
    }

    #[test]
    fn base64_roundtrip_keeps_txid() {
        let (psbt, _) = multisig_psbt(AddressType::P2wsh);
        let decoded = from_base64(&to_base64(&psbt)).unwrap();
        assert_eq!(unsigned_txid(&decoded), unsigned_txid(&psbt));
        assert!(from_base64("bm90IGEgcHNidA==").is_err());
    }

    #[test]
    fn extract_requires_finalization() {
        let (psbt, _) = multisig_psbt(AddressType::P2wsh);
        assert!(extract_transaction(&psbt).is_err());
        assert_eq!(spent_outpoints(&psbt), vec![format!("{}:0", hex::encode([7u8; 32]))]);
    }
}

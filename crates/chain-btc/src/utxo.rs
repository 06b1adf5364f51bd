use bitcoin::{Amount, OutPoint, ScriptBuf, TxOut, Txid};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::BtcError;
use crate::transaction::fee_for_weight;

/// A single unspent transaction output (UTXO).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Transaction ID as a hex string (big-endian / display order).
    pub txid: String,
    /// Output index within the transaction.
    pub vout: u32,
    /// Value in satoshis.
    pub amount_sat: u64,
    /// The locking script (scriptPubKey), hex encoded.
    pub script_pubkey: String,
    /// Confirmations at the last refresh; `0` for mempool outputs.
    #[serde(default)]
    pub confirmations: u32,
}

impl Utxo {
    pub fn outpoint(&self) -> Result<OutPoint, BtcError> {
        let txid: Txid = self
            .txid
            .parse()
            .map_err(|e| BtcError::TransactionBuildError(format!("invalid txid: {e}")))?;
        Ok(OutPoint::new(txid, self.vout))
    }

    /// `txid:vout`, the key reservations and staleness checks use.
    pub fn outpoint_key(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }

    pub fn script(&self) -> Result<ScriptBuf, BtcError> {
        let bytes = hex::decode(&self.script_pubkey)
            .map_err(|e| BtcError::TransactionBuildError(format!("invalid script hex: {e}")))?;
        Ok(ScriptBuf::from_bytes(bytes))
    }

    pub fn tx_out(&self) -> Result<TxOut, BtcError> {
        Ok(TxOut {
            value: Amount::from_sat(self.amount_sat),
            script_pubkey: self.script()?,
        })
    }
}

/// Inputs to coin selection. Weights are in weight units.
#[derive(Debug, Clone, Copy)]
pub struct SelectionParams {
    /// Amount paid to the recipient.
    pub target_sat: u64,
    pub fee_rate_sat_vbyte: u64,
    /// Transaction overhead plus the recipient output.
    pub base_weight: u64,
    /// Worst-case weight of one signed input.
    pub input_weight: u64,
    pub change_output_weight: u64,
    /// Smallest change output worth creating.
    pub dust_threshold_sat: u64,
    pub max_inputs: usize,
    pub max_fee_sat: u64,
}

impl SelectionParams {
    fn fee(&self, inputs: usize, with_change: bool) -> u64 {
        let mut weight = self
            .base_weight
            .saturating_add((inputs as u64).saturating_mul(self.input_weight));
        if with_change {
            weight = weight.saturating_add(self.change_output_weight);
        }
        fee_for_weight(weight, self.fee_rate_sat_vbyte)
    }

    /// Target plus the fee for `inputs` inputs.
    fn need(&self, inputs: usize, with_change: bool) -> Result<u64, BtcError> {
        let fee = self.fee(inputs, with_change);
        self.target_sat
            .checked_add(fee)
            .ok_or_else(|| BtcError::AmountOutOfRange(format!("{} sat plus a fee of {fee} sat", self.target_sat)))
    }

    /// Fee one more input adds.
    fn input_fee(&self) -> u64 {
        fee_for_weight(self.input_weight, self.fee_rate_sat_vbyte)
    }
}

/// Result of UTXO selection.
#[derive(Debug, Clone)]
pub struct UtxoSelection {
    /// The selected UTXOs, in transaction input order.
    pub selected: Vec<Utxo>,
    /// Total value of the selected UTXOs in satoshis.
    pub total_sat: u64,
    /// Fee paid, including any sub-dust remainder absorbed.
    pub fee_sat: u64,
    /// Change value; `0` means no change output.
    pub change_sat: u64,
}

impl UtxoSelection {
    pub fn has_change(&self) -> bool {
        self.change_sat > 0
    }
}

fn total_of<'a>(utxos: impl IntoIterator<Item = &'a Utxo>) -> u64 {
    utxos
        .into_iter()
        .fold(0u64, |acc, u| acc.saturating_add(u.amount_sat))
}

/// Selects inputs for a payment.
///
/// `candidates` must already exclude reserved and under-confirmed outputs.
/// Outputs worth no more than the fee to spend them are skipped. A single
/// output that pays the target with sub-dust excess is taken alone without
/// change. Otherwise candidates are shuffled and accumulated until they
/// cover the payment with a non-dust change output. If that never happens,
/// the shortest accumulated prefix that pays the target without change is
/// used and its sub-dust remainder goes to the fee. No dust output is ever
/// produced.
pub fn select_utxos<R: Rng + ?Sized>(
    candidates: &[Utxo],
    params: &SelectionParams,
    rng: &mut R,
) -> Result<UtxoSelection, BtcError> {
    let input_fee = params.input_fee();
    let economic: Vec<&Utxo> = candidates
        .iter()
        .filter(|u| u.amount_sat > input_fee)
        .collect();
    if economic.len() < candidates.len() {
        tracing::debug!(
            skipped = candidates.len() - economic.len(),
            input_fee,
            "skipping outputs worth less than their input fee"
        );
    }

    let available = total_of(economic.iter().copied());
    let minimum_need = params.need(1, false)?;
    if economic.is_empty() || available < minimum_need {
        return Err(BtcError::InsufficientFunds {
            have: available,
            need: minimum_need,
        });
    }

    let changeless: Vec<&Utxo> = economic
        .iter()
        .copied()
        .filter(|u| u.amount_sat >= minimum_need && u.amount_sat - minimum_need < params.dust_threshold_sat)
        .collect();
    if let Some(utxo) = changeless.choose(rng) {
        tracing::debug!(amount_sat = utxo.amount_sat, "changeless single-input selection");
        return finish(vec![(*utxo).clone()], 0, params);
    }

    let mut order = economic;
    order.shuffle(rng);

    let mut selected: Vec<Utxo> = Vec::new();
    let mut total: u64 = 0;
    let mut settled: Option<usize> = None;
    let mut limited = false;
    for utxo in order {
        if selected.len() == params.max_inputs {
            limited = true;
            break;
        }
        selected.push(utxo.clone());
        total = total.saturating_add(utxo.amount_sat);

        let need = params.need(selected.len(), true)?;
        if total >= need && total - need >= params.dust_threshold_sat {
            let change = total - need;
            return finish(selected, change, params);
        }
        if settled.is_none() && total >= params.need(selected.len(), false)? {
            settled = Some(selected.len());
        }
    }

    if let Some(count) = settled {
        selected.truncate(count);
        tracing::debug!(inputs = count, "sub-dust remainder goes to the fee");
        return finish(selected, 0, params);
    }
    if limited {
        return Err(BtcError::TooManyInputs {
            needed: params.max_inputs + 1,
            max: params.max_inputs,
        });
    }
    Err(BtcError::InsufficientFunds {
        have: total,
        need: params.need(selected.len(), false)?,
    })
}

fn finish(
    selected: Vec<Utxo>,
    change_sat: u64,
    params: &SelectionParams,
) -> Result<UtxoSelection, BtcError> {
    let total_sat = total_of(&selected);
    let fee_sat = total_sat - params.target_sat - change_sat;
    if fee_sat > params.max_fee_sat {
        return Err(BtcError::FeeCeilingExceeded {
            fee: fee_sat,
            ceiling: params.max_fee_sat,
        });
    }
    Ok(UtxoSelection {
        selected,
        total_sat,
        fee_sat,
        change_sat,
    })
}

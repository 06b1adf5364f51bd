use bitcoin::absolute::LockTime;
use bitcoin::script::ScriptBuf;
use bitcoin::transaction::Version;
use bitcoin::{OutPoint, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::address::AddressType;
use crate::error::BtcError;
use crate::multisig::validate_threshold;

/// Version, locktime and one-byte input/output counts, in weight units.
pub const TX_OVERHEAD_WEIGHT: u64 = 40;

/// Segwit marker and flag bytes (witness data, one WU each).
pub const SEGWIT_FLAG_WEIGHT: u64 = 2;

/// Push of a worst-case low-S DER signature with its sighash byte.
const SIG_PUSH: u64 = 1 + 72;

/// Push of a 33-byte compressed key.
const COMPRESSED_KEY_PUSH: u64 = 1 + 33;

/// Push of a 65-byte uncompressed key.
const UNCOMPRESSED_KEY_PUSH: u64 = 1 + 65;

/// Outpoint (36) and sequence (4).
const INPUT_FIXED_BYTES: u64 = 36 + 4;

/// P2WPKH weight estimates, kept for the simple-send estimate below.
const P2WPKH_INPUT_WEIGHT: u64 = 272;
const P2WPKH_OUTPUT_WEIGHT: u64 = 124;

/// How an input will be spent, which fixes its worst-case weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendProfile {
    P2pkh { compressed: bool },
    P2shP2wpkh,
    P2wpkh,
    P2wsh { required: usize, total: usize },
    P2shP2wsh { required: usize, total: usize },
    P2sh { required: usize, total: usize },
}

impl SpendProfile {
    pub fn single_sig(address_type: AddressType, compressed: bool) -> Result<Self, BtcError> {
        match address_type {
            AddressType::Legacy => Ok(SpendProfile::P2pkh { compressed }),
            AddressType::Segwit if compressed => Ok(SpendProfile::P2shP2wpkh),
            AddressType::NativeSegwit if compressed => Ok(SpendProfile::P2wpkh),
            _ => Err(BtcError::IncompatibleAddressType {
                address_type: address_type.to_string(),
                reason: if compressed {
                    "a single key".into()
                } else {
                    "an uncompressed key".into()
                },
            }),
        }
    }

    pub fn multisig(
        address_type: AddressType,
        required: usize,
        total: usize,
    ) -> Result<Self, BtcError> {
        validate_threshold(required, total)?;
        match address_type {
            AddressType::P2wsh => Ok(SpendProfile::P2wsh { required, total }),
            AddressType::P2shP2wsh => Ok(SpendProfile::P2shP2wsh { required, total }),
            AddressType::P2sh => Ok(SpendProfile::P2sh { required, total }),
            AddressType::Legacy | AddressType::Segwit | AddressType::NativeSegwit => {
                Err(BtcError::IncompatibleAddressType {
                    address_type: address_type.to_string(),
                    reason: "a multisig script".into(),
                })
            }
        }
    }

    pub fn has_witness(&self) -> bool {
        !matches!(self, SpendProfile::P2pkh { .. } | SpendProfile::P2sh { .. })
    }

    /// Worst-case weight of one signed input.
    pub fn input_weight(&self) -> u64 {
        match *self {
            SpendProfile::P2pkh { compressed } => {
                let key = if compressed {
                    COMPRESSED_KEY_PUSH
                } else {
                    UNCOMPRESSED_KEY_PUSH
                };
                let script_sig = SIG_PUSH + key;
                (INPUT_FIXED_BYTES + varint_len(script_sig) + script_sig) * 4
            }
            SpendProfile::P2shP2wpkh => {
                // scriptSig pushes the 22-byte witness program.
                (INPUT_FIXED_BYTES + 1 + 23) * 4 + p2wpkh_witness_weight()
            }
            SpendProfile::P2wpkh => (INPUT_FIXED_BYTES + 1) * 4 + p2wpkh_witness_weight(),
            SpendProfile::P2wsh { required, total } => {
                (INPUT_FIXED_BYTES + 1) * 4 + multisig_witness_weight(required, total)
            }
            SpendProfile::P2shP2wsh { required, total } => {
                // scriptSig pushes the 34-byte witness program.
                (INPUT_FIXED_BYTES + 1 + 35) * 4 + multisig_witness_weight(required, total)
            }
            SpendProfile::P2sh { required, total } => {
                let script_len = multisig_script_len(total);
                let push_len = script_len + push_opcode_len(script_len);
                // OP_0 dummy, signatures, redeem script.
                let script_sig = 1 + required as u64 * SIG_PUSH + push_len;
                (INPUT_FIXED_BYTES + varint_len(script_sig) + script_sig) * 4
            }
        }
    }
}

fn p2wpkh_witness_weight() -> u64 {
    1 + SIG_PUSH + COMPRESSED_KEY_PUSH
}

fn multisig_witness_weight(required: usize, total: usize) -> u64 {
    let script_len = multisig_script_len(total);
    // Item count, empty dummy, signatures, witness script.
    1 + 1 + required as u64 * SIG_PUSH + varint_len(script_len) + script_len
}

/// Length of a bare `m-of-n` multisig script with compressed keys.
pub fn multisig_script_len(total: usize) -> u64 {
    3 + COMPRESSED_KEY_PUSH * total as u64
}

fn push_opcode_len(len: u64) -> u64 {
    match len {
        0..=75 => 1,
        76..=255 => 2,
        _ => 3,
    }
}

/// Bitcoin CompactSize length.
pub fn varint_len(n: u64) -> u64 {
    match n {
        0..=252 => 1,
        253..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Weight of an output whose scriptPubKey is `script_len` bytes.
pub fn output_weight(script_len: usize) -> u64 {
    let len = script_len as u64;
    (8 + varint_len(len) + len) * 4
}

/// Weight of an empty transaction.
pub fn base_weight(has_witness: bool) -> u64 {
    if has_witness {
        TX_OVERHEAD_WEIGHT + SEGWIT_FLAG_WEIGHT
    } else {
        TX_OVERHEAD_WEIGHT
    }
}

pub fn weight_to_vsize(weight: u64) -> u64 {
    weight.div_ceil(4)
}

/// Fee in satoshis for a transaction of `weight` at `fee_rate_sat_vbyte`.
pub fn fee_for_weight(weight: u64, fee_rate_sat_vbyte: u64) -> u64 {
    weight_to_vsize(weight).saturating_mul(fee_rate_sat_vbyte)
}

/// Estimate the fee for an all-P2WPKH transaction.
pub fn estimate_fee(num_inputs: usize, num_outputs: usize, fee_rate_sat_vbyte: u64) -> u64 {
    let weight = base_weight(true)
        + num_inputs as u64 * P2WPKH_INPUT_WEIGHT
        + num_outputs as u64 * P2WPKH_OUTPUT_WEIGHT;
    fee_for_weight(weight, fee_rate_sat_vbyte)
}

/// Builds an unsigned version-2 transaction with RBF signalled on every
/// input.
pub fn unsigned_transaction(inputs: &[OutPoint], outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            })
            .collect(),
        output: outputs,
    }
}

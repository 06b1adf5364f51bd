use bitcoin::address::Address;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::script::{Builder, Instruction, Script, ScriptBuf};
use bitcoin::{CompressedPublicKey, PublicKey};

use crate::address::AddressType;
use crate::error::BtcError;
use crate::network::BtcNetwork;

/// Standardness limit on keys in a bare `OP_CHECKMULTISIG` script.
pub const MAX_MULTISIG_KEYS: usize = 15;

/// Checks `1 <= required <= total <= 15`.
pub fn validate_threshold(required: usize, total: usize) -> Result<(), BtcError> {
    if required == 0 {
        return Err(BtcError::InvalidMultisig("threshold must be at least 1".into()));
    }
    if required > total {
        return Err(BtcError::InvalidMultisig(format!(
            "threshold {required} exceeds {total} cosigners"
        )));
    }
    if total > MAX_MULTISIG_KEYS {
        return Err(BtcError::InvalidMultisig(format!(
            "{total} cosigners exceeds the limit of {MAX_MULTISIG_KEYS}"
        )));
    }
    Ok(())
}

/// Builds `OP_m <pk…> OP_n OP_CHECKMULTISIG` with keys sorted
/// lexicographically by their compressed serialization (BIP67).
///
/// The caller's key order does not affect the result.
pub fn sorted_multisig_script(
    required: usize,
    pubkeys: &[CompressedPublicKey],
) -> Result<ScriptBuf, BtcError> {
    validate_threshold(required, pubkeys.len())?;

    let mut sorted = pubkeys.to_vec();
    sorted.sort_unstable_by_key(|pk| pk.to_bytes());
    if sorted.windows(2).any(|pair| pair[0] == pair[1]) {
        return Err(BtcError::InvalidMultisig("duplicate cosigner key".into()));
    }

    let mut builder = Builder::new().push_int(required as i64);
    for key in &sorted {
        builder = builder.push_key(&PublicKey::new(key.0));
    }
    Ok(builder
        .push_int(sorted.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

/// Parses a bare multisig script into its threshold and keys, in script
/// order.
pub fn parse_multisig_script(script: &Script) -> Result<(usize, Vec<PublicKey>), BtcError> {
    let invalid = |what: &str| BtcError::InvalidMultisig(format!("not a multisig script: {what}"));

    let mut instructions = Vec::new();
    for ins in script.instructions() {
        instructions.push(ins.map_err(|e| BtcError::InvalidMultisig(e.to_string()))?);
    }
    if instructions.len() < 4 {
        return Err(invalid("too short"));
    }

    let small_int = |ins: &Instruction<'_>| -> Option<usize> {
        match ins {
            Instruction::Op(op) => {
                let code = op.to_u8();
                if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&code) {
                    Some((code - OP_PUSHNUM_1.to_u8() + 1) as usize)
                } else {
                    None
                }
            }
            _ => None,
        }
    };

    let last = instructions.len() - 1;
    match &instructions[last] {
        Instruction::Op(op) if *op == OP_CHECKMULTISIG => {}
        _ => return Err(invalid("missing OP_CHECKMULTISIG")),
    }
    let required = small_int(&instructions[0]).ok_or_else(|| invalid("bad threshold"))?;
    let total = small_int(&instructions[last - 1]).ok_or_else(|| invalid("bad key count"))?;

    let mut keys = Vec::with_capacity(total);
    for ins in &instructions[1..last - 1] {
        match ins {
            Instruction::PushBytes(bytes) => {
                let key = PublicKey::from_slice(bytes.as_bytes())
                    .map_err(|e| BtcError::InvalidPublicKey(e.to_string()))?;
                keys.push(key);
            }
            Instruction::Op(_) => return Err(invalid("unexpected opcode")),
        }
    }
    if keys.len() != total || required > total {
        return Err(invalid("key count mismatch"));
    }
    Ok((required, keys))
}

/// Renders the address that locks funds to `script` under `address_type`.
pub fn multisig_address(
    script: &Script,
    address_type: AddressType,
    network: BtcNetwork,
) -> Result<Address, BtcError> {
    match address_type {
        AddressType::P2wsh => Ok(Address::p2wsh(script, network.to_bitcoin_network())),
        AddressType::P2shP2wsh => Ok(Address::p2shwsh(script, network.kind())),
        AddressType::P2sh => Address::p2sh(script, network.kind())
            .map_err(|e| BtcError::InvalidMultisig(format!("redeem script too large: {e}"))),
        AddressType::Legacy | AddressType::Segwit | AddressType::NativeSegwit => {
            Err(BtcError::IncompatibleAddressType {
                address_type: address_type.to_string(),
                reason: "a multisig script".into(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn keys(n: u8) -> Vec<CompressedPublicKey> {
        let secp = Secp256k1::new();
        (1..=n)
            .map(|i| {
                let sk = SecretKey::from_slice(&[i; 32]).unwrap();
                CompressedPublicKey(bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk))
            })
            .collect()
    }

    #[test]
    fn key_order_does_not_change_script() {
        let ks = keys(3);
        let forward = sorted_multisig_script(2, &ks).unwrap();
        let reversed: Vec<_> = ks.iter().rev().copied().collect();
        let backward = sorted_multisig_script(2, &reversed).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn script_keys_are_sorted() {
        let script = sorted_multisig_script(2, &keys(3)).unwrap();
        let (required, parsed) = parse_multisig_script(&script).unwrap();
        assert_eq!(required, 2);
        assert_eq!(parsed.len(), 3);
        let serialized: Vec<_> = parsed.iter().map(|k| k.to_bytes()).collect();
        let mut sorted = serialized.clone();
        sorted.sort();
        assert_eq!(serialized, sorted);
    }

    #[test]
    fn script_size_matches_layout() {
        let script = sorted_multisig_script(2, &keys(3)).unwrap();
        assert_eq!(script.len(), 3 + 34 * 3);
    }

    #[test]
    fn threshold_bounds_are_enforced() {
        assert!(sorted_multisig_script(0, &keys(2)).is_err());
        assert!(sorted_multisig_script(3, &keys(2)).is_err());
        assert!(validate_threshold(1, 16).is_err());
        assert!(validate_threshold(15, 15).is_ok());
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut ks = keys(2);
        ks.push(ks[0]);
        assert!(matches!(
            sorted_multisig_script(2, &ks),
            Err(BtcError::InvalidMultisig(_))
        ));
    }

    #[test]
    fn address_prefixes_per_type() {
        let script = sorted_multisig_script(2, &keys(3)).unwrap();
        let wsh = multisig_address(&script, AddressType::P2wsh, BtcNetwork::Mainnet).unwrap();
        let sh_wsh =
            multisig_address(&script, AddressType::P2shP2wsh, BtcNetwork::Mainnet).unwrap();
        let sh = multisig_address(&script, AddressType::P2sh, BtcNetwork::Mainnet).unwrap();

        assert!(wsh.to_string().starts_with("bc1q"));
        assert_eq!(wsh.script_pubkey().len(), AddressType::P2wsh.script_pubkey_len());
        assert!(sh_wsh.to_string().starts_with('3'));
        assert!(sh.to_string().starts_with('3'));
        assert_ne!(sh_wsh, sh);
    }

    #[test]
    fn single_sig_type_is_not_a_multisig_encoding() {
        let script = sorted_multisig_script(1, &keys(1)).unwrap();
        assert!(multisig_address(&script, AddressType::NativeSegwit, BtcNetwork::Testnet).is_err());
    }

    #[test]
    fn parse_rejects_non_multisig() {
        let p2wpkh = ScriptBuf::new_p2wpkh(&keys(1)[0].wpubkey_hash());
        assert!(parse_multisig_script(&p2wpkh).is_err());
    }
}

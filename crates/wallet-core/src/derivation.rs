//! BIP32 derivation for single-key and multisig accounts.
//!
//! Addresses are derived from public material only (account xpubs, cosigner
//! xpubs, imported public keys), so any index can be derived without the
//! seed. Single-sig accounts follow BIP44/49/84, multisig accounts BIP48
//! (`p2wsh`, `p2sh-p2wsh`) or BIP45 (`p2sh`).

use std::collections::BTreeMap;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, KeySource, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, CompressedPublicKey, PublicKey, ScriptBuf};
use chain_btc::address::single_sig_address;
use chain_btc::multisig::{multisig_address, sorted_multisig_script, validate_threshold};
use chain_btc::{AddressType, BtcNetwork};

use crate::error::WalletError;
use crate::key_material::{format_path, parse_path};
use crate::types::{Account, AccountKind, Chain, Cosigner, IssuedAddress};

/// First hardened index; child indices must stay below it.
const HARDENED_START: u32 = 1 << 31;

/// BIP48 script-type level.
const BIP48_P2SH_P2WSH: u32 = 1;
const BIP48_P2WSH: u32 = 2;

/// Length of a serialized extended key.
const XKEY_LEN: usize = 78;

/// SLIP-132 extended public key version bytes.
const SLIP132_VERSIONS: [([u8; 4], BtcNetwork, &str); 10] = [
    ([0x04, 0x88, 0xb2, 0x1e], BtcNetwork::Mainnet, "xpub"),
    ([0x04, 0x9d, 0x7c, 0xb2], BtcNetwork::Mainnet, "ypub"),
    ([0x04, 0xb2, 0x47, 0x46], BtcNetwork::Mainnet, "zpub"),
    ([0x02, 0x95, 0xb4, 0x3f], BtcNetwork::Mainnet, "Ypub"),
    ([0x02, 0xaa, 0x7e, 0xd3], BtcNetwork::Mainnet, "Zpub"),
    ([0x04, 0x35, 0x87, 0xcf], BtcNetwork::Testnet, "tpub"),
    ([0x04, 0x4a, 0x52, 0x62], BtcNetwork::Testnet, "upub"),
    ([0x04, 0x5f, 0x1c, 0xf6], BtcNetwork::Testnet, "vpub"),
    ([0x02, 0x42, 0x89, 0xef], BtcNetwork::Testnet, "Upub"),
    ([0x02, 0x57, 0x54, 0x83], BtcNetwork::Testnet, "Vpub"),
];

/// An address with everything needed to spend from it.
#[derive(Debug, Clone)]
pub struct DerivedAddress {
    pub address: Address,
    pub chain: Chain,
    pub index: u32,
    /// Full path for single-sig HD keys, the `chain/index` suffix below
    /// each cosigner xpub for multisig, absent for imported keys.
    pub derivation_path: Option<String>,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
    /// Every key that can sign for this address, with its origin.
    pub key_origins: BTreeMap<bitcoin::secp256k1::PublicKey, KeySource>,
}

impl DerivedAddress {
    pub fn to_issued(&self) -> IssuedAddress {
        IssuedAddress {
            address: self.address.to_string(),
            script_pubkey: self.address.script_pubkey().to_hex_string(),
            chain: self.chain,
            index: self.index,
            derivation_path: self.derivation_path.clone(),
            used: false,
        }
    }
}

fn child(index: u32) -> Result<ChildNumber, WalletError> {
    if index >= HARDENED_START {
        return Err(WalletError::Derivation(format!(
            "index {index} is outside the non-hardened range"
        )));
    }
    ChildNumber::from_normal_idx(index).map_err(|e| WalletError::Derivation(e.to_string()))
}

fn hardened(index: u32) -> Result<ChildNumber, WalletError> {
    ChildNumber::from_hardened_idx(index).map_err(|e| WalletError::Derivation(e.to_string()))
}

/// `m/purpose'/coin'/account'` for a single-key address type.
pub fn single_sig_account_path(
    address_type: AddressType,
    network: BtcNetwork,
    account_index: u32,
) -> Result<DerivationPath, WalletError> {
    let purpose = address_type.single_sig_purpose().ok_or_else(|| {
        WalletError::IncompatibleAddressType {
            address_type: address_type.to_string(),
            reason: "not a single-key encoding".into(),
        }
    })?;
    Ok(DerivationPath::from(vec![
        hardened(purpose)?,
        hardened(network.coin_type())?,
        hardened(account_index)?,
    ]))
}

/// BIP48 `m/48'/coin'/account'/script'`, or BIP45 `m/45'` for bare P2SH.
pub fn multisig_account_path(
    address_type: AddressType,
    network: BtcNetwork,
    account_index: u32,
) -> Result<DerivationPath, WalletError> {
    let script_type = match address_type {
        AddressType::P2wsh => BIP48_P2WSH,
        AddressType::P2shP2wsh => BIP48_P2SH_P2WSH,
        AddressType::P2sh => return Ok(DerivationPath::from(vec![hardened(45)?])),
        other => {
            return Err(WalletError::IncompatibleAddressType {
                address_type: other.to_string(),
                reason: "not a multisig encoding".into(),
            })
        }
    };
    Ok(DerivationPath::from(vec![
        hardened(48)?,
        hardened(network.coin_type())?,
        hardened(account_index)?,
        hardened(script_type)?,
    ]))
}

pub fn derive_external_address(
    account: &Account,
    index: u32,
    secp: &Secp256k1<All>,
) -> Result<DerivedAddress, WalletError> {
    derive_address(account, Chain::External, index, secp)
}

pub fn derive_internal_address(
    account: &Account,
    index: u32,
    secp: &Secp256k1<All>,
) -> Result<DerivedAddress, WalletError> {
    derive_address(account, Chain::Internal, index, secp)
}

pub fn derive_address(
    account: &Account,
    chain: Chain,
    index: u32,
    secp: &Secp256k1<All>,
) -> Result<DerivedAddress, WalletError> {
    match &account.kind {
        AccountKind::HdSingle {
            master_fingerprint,
            account_xpub,
            derivation_path,
            ..
        } => {
            let xpub = parse_xpub(account_xpub)?;
            let child_key = xpub
                .derive_pub(secp, &[child(chain.index())?, child(index)?])
                .map_err(|e| WalletError::Derivation(e.to_string()))?;
            let pubkey = PublicKey::new(child_key.public_key);
            let address = single_sig_address(&pubkey, account.address_type, account.network)?;

            let full_path = parse_path(derivation_path)?
                .child(child(chain.index())?)
                .child(child(index)?);
            let fingerprint = parse_fingerprint(master_fingerprint)?;

            Ok(DerivedAddress {
                redeem_script: nested_p2wpkh_redeem(&pubkey, account.address_type),
                witness_script: None,
                derivation_path: Some(format_path(&full_path)),
                key_origins: BTreeMap::from([(pubkey.inner, (fingerprint, full_path))]),
                address,
                chain,
                index,
            })
        }
        AccountKind::ImportedSingle { public_key, .. } => {
            if chain != Chain::External || index != 0 {
                return Err(WalletError::Derivation(
                    "an imported key has a single address and no internal chain".into(),
                ));
            }
            let pubkey = PublicKey::from_str(public_key)
                .map_err(|e| WalletError::Derivation(format!("stored public key: {e}")))?;
            let address = single_sig_address(&pubkey, account.address_type, account.network)?;
            Ok(DerivedAddress {
                redeem_script: nested_p2wpkh_redeem(&pubkey, account.address_type),
                witness_script: None,
                derivation_path: None,
                key_origins: BTreeMap::from([(
                    pubkey.inner,
                    (imported_fingerprint(&pubkey), DerivationPath::master()),
                )]),
                address,
                chain,
                index,
            })
        }
        AccountKind::Multisig {
            required,
            total,
            cosigners,
            ..
        } => derive_multisig_address(
            *required,
            *total,
            cosigners,
            account.address_type,
            account.network,
            chain,
            index,
            secp,
        ),
    }
}

/// Derives the `chain/index` multisig address shared by all cosigners.
///
/// Child keys are combined in BIP67 order, so the caller's cosigner order
/// never changes the script.
#[allow(clippy::too_many_arguments)]
pub fn derive_multisig_address(
    required: usize,
    total: usize,
    cosigners: &[Cosigner],
    address_type: AddressType,
    network: BtcNetwork,
    chain: Chain,
    index: u32,
    secp: &Secp256k1<All>,
) -> Result<DerivedAddress, WalletError> {
    if cosigners.len() != total {
        return Err(WalletError::Derivation(format!(
            "{} cosigners supplied for a {required}-of-{total} account",
            cosigners.len()
        )));
    }
    validate_threshold(required, total)?;

    let suffix = [child(chain.index())?, child(index)?];
    let mut keys = Vec::with_capacity(total);
    let mut key_origins = BTreeMap::new();
    for cosigner in cosigners {
        let xpub = parse_xpub(&cosigner.xpub)?;
        let child_key = xpub
            .derive_pub(secp, &suffix)
            .map_err(|e| WalletError::Derivation(e.to_string()))?;
        let origin_path = parse_path(&cosigner.derivation_path)?.extend(suffix);
        key_origins.insert(
            child_key.public_key,
            (parse_fingerprint(&cosigner.fingerprint)?, origin_path),
        );
        keys.push(CompressedPublicKey(child_key.public_key));
    }

    let script = sorted_multisig_script(required, &keys)?;
    let address = multisig_address(&script, address_type, network)?;
    let (redeem_script, witness_script) = match address_type {
        AddressType::P2wsh => (None, Some(script)),
        AddressType::P2shP2wsh => (Some(ScriptBuf::new_p2wsh(&script.wscript_hash())), Some(script)),
        _ => (Some(script), None),
    };

    Ok(DerivedAddress {
        address,
        chain,
        index,
        derivation_path: Some(format!("{}/{}", chain.index(), index)),
        redeem_script,
        witness_script,
        key_origins,
    })
}

fn nested_p2wpkh_redeem(pubkey: &PublicKey, address_type: AddressType) -> Option<ScriptBuf> {
    (address_type == AddressType::Segwit && pubkey.compressed)
        .then(|| ScriptBuf::new_p2wpkh(&CompressedPublicKey(pubkey.inner).wpubkey_hash()))
}

/// Stand-in origin fingerprint for a key with no BIP32 parent: the first
/// four bytes of its HASH160.
pub fn imported_fingerprint(pubkey: &PublicKey) -> Fingerprint {
    let hash = pubkey.pubkey_hash().to_byte_array();
    Fingerprint::from([hash[0], hash[1], hash[2], hash[3]])
}

pub fn parse_fingerprint(fingerprint: &str) -> Result<Fingerprint, WalletError> {
    Fingerprint::from_str(fingerprint)
        .map_err(|e| WalletError::InvalidXpub(format!("invalid fingerprint {fingerprint}: {e}")))
}

fn parse_xpub(xpub: &str) -> Result<Xpub, WalletError> {
    Xpub::from_str(xpub).map_err(|e| WalletError::InvalidXpub(e.to_string()))
}

/// Decodes an extended public key in any SLIP-132 flavour and re-encodes
/// it with the plain `xpub`/`tpub` version for `network`.
pub fn normalize_xpub(encoded: &str, network: BtcNetwork) -> Result<Xpub, WalletError> {
    let mut data = bs58::decode(encoded.trim())
        .with_check(None)
        .into_vec()
        .map_err(|e| WalletError::InvalidXpub(format!("base58check decode failed: {e}")))?;
    if data.len() != XKEY_LEN {
        return Err(WalletError::InvalidXpub(format!(
            "expected {XKEY_LEN} bytes, got {}",
            data.len()
        )));
    }

    let version = &data[..4];
    let (_, key_network, _) = SLIP132_VERSIONS
        .iter()
        .find(|(bytes, _, _)| bytes == version)
        .ok_or_else(|| {
            WalletError::InvalidXpub(format!(
                "unknown version bytes {}, not an extended public key",
                hex::encode(version)
            ))
        })?;
    network.ensure_matches(*key_network)?;

    data[..4].copy_from_slice(&standard_version(network));
    Xpub::decode(&data).map_err(|e| WalletError::InvalidXpub(e.to_string()))
}

fn standard_version(network: BtcNetwork) -> [u8; 4] {
    match network {
        BtcNetwork::Mainnet => SLIP132_VERSIONS[0].0,
        BtcNetwork::Testnet => SLIP132_VERSIONS[5].0,
    }
}

/// The SLIP-132 rendering other wallets expect for `address_type`
/// (`zpub` for native segwit, `Zpub` for P2WSH multisig, …).
pub fn to_slip132(xpub: &Xpub, address_type: AddressType, network: BtcNetwork) -> String {
    let prefix = match (network, address_type) {
        (BtcNetwork::Mainnet, AddressType::Segwit) => "ypub",
        (BtcNetwork::Mainnet, AddressType::NativeSegwit) => "zpub",
        (BtcNetwork::Mainnet, AddressType::P2shP2wsh) => "Ypub",
        (BtcNetwork::Mainnet, AddressType::P2wsh) => "Zpub",
        (BtcNetwork::Mainnet, _) => "xpub",
        (BtcNetwork::Testnet, AddressType::Segwit) => "upub",
        (BtcNetwork::Testnet, AddressType::NativeSegwit) => "vpub",
        (BtcNetwork::Testnet, AddressType::P2shP2wsh) => "Upub",
        (BtcNetwork::Testnet, AddressType::P2wsh) => "Vpub",
        (BtcNetwork::Testnet, _) => "tpub",
    };
    let version = SLIP132_VERSIONS
        .iter()
        .find(|(_, _, name)| *name == prefix)
        .map(|(bytes, _, _)| *bytes)
        .unwrap_or_else(|| standard_version(network));

    let mut data = xpub.encode();
    data[..4].copy_from_slice(&version);
    bs58::encode(&data[..]).with_check().into_string()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::key_material::SeedKey;
    use crate::mnemonic::mnemonic_to_seed;

    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const ABANDON_ZPUB: &str = "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs";

    fn hd_account(address_type: AddressType, network: BtcNetwork) -> Account {
        let secp = Secp256k1::new();
        let seed = SeedKey::new(mnemonic_to_seed(ABANDON, "").unwrap(), network, &secp).unwrap();
        let path = single_sig_account_path(address_type, network, 0).unwrap();
        Account {
            id: 1,
            name: "hd".into(),
            kind: AccountKind::HdSingle {
                account_index: 0,
                master_fingerprint: seed.fingerprint().to_string(),
                account_xpub: seed.xpub_at(&path, &secp).unwrap().to_string(),
                derivation_path: format_path(&path),
            },
            address_type,
            network,
            external_index: 0,
            internal_index: 0,
            created_at: Utc::now(),
        }
    }

    fn cosigners(network: BtcNetwork, address_type: AddressType) -> Vec<Cosigner> {
        let secp = Secp256k1::new();
        (1u8..=3)
            .map(|n| {
                let seed = SeedKey::new(zeroize::Zeroizing::new([n; 64]), network, &secp).unwrap();
                let path = multisig_account_path(address_type, network, 0).unwrap();
                Cosigner {
                    fingerprint: seed.fingerprint().to_string(),
                    xpub: seed.xpub_at(&path, &secp).unwrap().to_string(),
                    derivation_path: format_path(&path),
                    nickname: format!("signer {n}"),
                }
            })
            .collect()
    }

    #[test]
    fn bip84_mainnet_vectors() {
        let secp = Secp256k1::new();
        let account = hd_account(AddressType::NativeSegwit, BtcNetwork::Mainnet);
        let receive = derive_external_address(&account, 0, &secp).unwrap();
        let change = derive_internal_address(&account, 0, &secp).unwrap();
        assert_eq!(receive.address.to_string(), "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
        assert_eq!(change.address.to_string(), "bc1q8c6fshw2dlwun7ekn9qwf37cu2rn755upcp6el");
        assert_eq!(receive.derivation_path.as_deref(), Some("m/84'/0'/0'/0/0"));
    }

    #[test]
    fn bip49_testnet_vector() {
        let secp = Secp256k1::new();
        let account = hd_account(AddressType::Segwit, BtcNetwork::Testnet);
        let receive = derive_external_address(&account, 0, &secp).unwrap();
        assert_eq!(receive.address.to_string(), "2Mww8dCYPUpKHofjgcXcBCEGmniw9CoaiD2");
        assert!(receive.redeem_script.unwrap().is_p2wpkh());
    }

    #[test]
    fn account_xpub_renders_as_published_zpub() {
        let account = hd_account(AddressType::NativeSegwit, BtcNetwork::Mainnet);
        let AccountKind::HdSingle { account_xpub, .. } = &account.kind else {
            unreachable!()
        };
        let xpub = Xpub::from_str(account_xpub).unwrap();
        assert_eq!(
            to_slip132(&xpub, AddressType::NativeSegwit, BtcNetwork::Mainnet),
            ABANDON_ZPUB
        );
    }

    #[test]
    fn slip132_zpub_normalizes_to_xpub() {
        let secp = Secp256k1::new();
        let xpub = normalize_xpub(ABANDON_ZPUB, BtcNetwork::Mainnet).unwrap();
        assert!(xpub.to_string().starts_with("xpub"));
        let child_key = xpub
            .derive_pub(&secp, &[child(0).unwrap(), child(0).unwrap()])
            .unwrap();
        let address = single_sig_address(
            &PublicKey::new(child_key.public_key),
            AddressType::NativeSegwit,
            BtcNetwork::Mainnet,
        )
        .unwrap();
        assert_eq!(address.to_string(), "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
    }

    #[test]
    fn slip132_rejects_wrong_network_and_garbage() {
        let err = normalize_xpub(ABANDON_ZPUB, BtcNetwork::Testnet).unwrap_err();
        assert_eq!(err.kind(), "network_mismatch");
        assert_eq!(
            normalize_xpub("zpubnotreally", BtcNetwork::Mainnet).unwrap_err().kind(),
            "invalid_xpub"
        );
    }

    #[test]
    fn testnet_slip132_prefixes_roundtrip() {
        let xpub = normalize_xpub(ABANDON_ZPUB, BtcNetwork::Mainnet).unwrap();
        let mut data = xpub.encode();
        data[..4].copy_from_slice(&standard_version(BtcNetwork::Testnet));
        let tpub = Xpub::decode(&data).unwrap();
        for ty in [AddressType::P2wsh, AddressType::P2shP2wsh, AddressType::NativeSegwit] {
            let encoded = to_slip132(&tpub, ty, BtcNetwork::Testnet);
            assert_eq!(normalize_xpub(&encoded, BtcNetwork::Testnet).unwrap(), tpub, "{ty}");
        }
    }

    #[test]
    fn hardened_range_is_rejected() {
        let secp = Secp256k1::new();
        let account = hd_account(AddressType::NativeSegwit, BtcNetwork::Testnet);
        let err = derive_external_address(&account, 1 << 31, &secp).unwrap_err();
        assert_eq!(err.kind(), "derivation");
        assert!(derive_external_address(&account, (1 << 31) - 1, &secp).is_ok());
    }

    #[test]
    fn multisig_paths_follow_bip48_and_bip45() {
        let p2wsh = multisig_account_path(AddressType::P2wsh, BtcNetwork::Testnet, 0).unwrap();
        let nested = multisig_account_path(AddressType::P2shP2wsh, BtcNetwork::Mainnet, 2).unwrap();
        let legacy = multisig_account_path(AddressType::P2sh, BtcNetwork::Mainnet, 0).unwrap();
        assert_eq!(format_path(&p2wsh), "m/48'/1'/0'/2'");
        assert_eq!(format_path(&nested), "m/48'/0'/2'/1'");
        assert_eq!(format_path(&legacy), "m/45'");
        assert!(multisig_account_path(AddressType::NativeSegwit, BtcNetwork::Mainnet, 0).is_err());
    }

    #[test]
    fn cosigner_order_does_not_change_address() {
        let secp = Secp256k1::new();
        let mut cs = cosigners(BtcNetwork::Testnet, AddressType::P2wsh);
        let a = derive_multisig_address(2, 3, &cs, AddressType::P2wsh, BtcNetwork::Testnet, Chain::External, 4, &secp)
            .unwrap();
        cs.reverse();
        let b = derive_multisig_address(2, 3, &cs, AddressType::P2wsh, BtcNetwork::Testnet, Chain::External, 4, &secp)
            .unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(a.key_origins.len(), 3);
        assert!(a.address.to_string().starts_with("tb1q"));
    }

    #[test]
    fn multisig_parameter_errors_are_derivation_errors() {
        let secp = Secp256k1::new();
        let cs = cosigners(BtcNetwork::Testnet, AddressType::P2wsh);
        for (m, n, list) in [(2, 4, &cs[..]), (4, 3, &cs[..]), (0, 3, &cs[..]), (2, 3, &cs[..2])] {
            let err = derive_multisig_address(m, n, list, AddressType::P2wsh, BtcNetwork::Testnet, Chain::External, 0, &secp)
                .unwrap_err();
            assert_eq!(err.kind(), "derivation", "{m}-of-{n}");
        }
    }

    #[test]
    fn imported_key_has_no_internal_chain() {
        let secp = Secp256k1::new();
        let pubkey = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
        let account = Account {
            kind: AccountKind::ImportedSingle {
                public_key: pubkey.into(),
                compressed: true,
            },
            ..hd_account(AddressType::Legacy, BtcNetwork::Mainnet)
        };
        let sole = derive_external_address(&account, 0, &secp).unwrap();
        assert_eq!(sole.address.to_string(), "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH");
        assert!(sole.derivation_path.is_none());
        assert!(derive_internal_address(&account, 0, &secp).is_err());
        assert!(derive_external_address(&account, 1, &secp).is_err());
    }
}

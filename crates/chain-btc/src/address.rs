use std::str::FromStr;

use bitcoin::address::{Address, NetworkUnchecked};
use bitcoin::{CompressedPublicKey, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::BtcError;
use crate::network::BtcNetwork;

/// Script encoding of an account's addresses.
///
/// The first three are single-key encodings, the last three are M-of-N
/// multisig encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressType {
    /// P2PKH (`1…` / `m…`).
    Legacy,
    /// P2SH-wrapped P2WPKH (`3…` / `2…`).
    Segwit,
    /// P2WPKH (`bc1q…` / `tb1q…`).
    NativeSegwit,
    P2wsh,
    P2shP2wsh,
    P2sh,
}

impl AddressType {
    pub const SINGLE_SIG: [AddressType; 3] = [
        AddressType::Legacy,
        AddressType::Segwit,
        AddressType::NativeSegwit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AddressType::Legacy => "legacy",
            AddressType::Segwit => "segwit",
            AddressType::NativeSegwit => "native-segwit",
            AddressType::P2wsh => "p2wsh",
            AddressType::P2shP2wsh => "p2sh-p2wsh",
            AddressType::P2sh => "p2sh",
        }
    }

    pub fn is_multisig(self) -> bool {
        matches!(
            self,
            AddressType::P2wsh | AddressType::P2shP2wsh | AddressType::P2sh
        )
    }

    /// Whether spending this type carries witness data.
    pub fn is_segwit(self) -> bool {
        !matches!(self, AddressType::Legacy | AddressType::P2sh)
    }

    /// BIP44/49/84 purpose for single-sig types.
    pub fn single_sig_purpose(self) -> Option<u32> {
        match self {
            AddressType::Legacy => Some(44),
            AddressType::Segwit => Some(49),
            AddressType::NativeSegwit => Some(84),
            AddressType::P2wsh | AddressType::P2shP2wsh | AddressType::P2sh => None,
        }
    }

    /// Length in bytes of the scriptPubKey this type produces.
    pub fn script_pubkey_len(self) -> usize {
        match self {
            AddressType::Legacy => 25,
            AddressType::NativeSegwit => 22,
            AddressType::P2wsh => 34,
            AddressType::Segwit | AddressType::P2shP2wsh | AddressType::P2sh => 23,
        }
    }
}

impl std::fmt::Display for AddressType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressType {
    type Err = BtcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" | "p2pkh" => Ok(AddressType::Legacy),
            "segwit" | "p2sh-p2wpkh" => Ok(AddressType::Segwit),
            "native-segwit" | "p2wpkh" => Ok(AddressType::NativeSegwit),
            "p2wsh" => Ok(AddressType::P2wsh),
            "p2sh-p2wsh" => Ok(AddressType::P2shP2wsh),
            "p2sh" => Ok(AddressType::P2sh),
            other => Err(BtcError::InvalidAddress(format!(
                "unknown address type: {other}"
            ))),
        }
    }
}

/// Renders a single-key address.
///
/// Segwit encodings require a compressed key; multisig types are rejected.
pub fn single_sig_address(
    pubkey: &PublicKey,
    address_type: AddressType,
    network: BtcNetwork,
) -> Result<Address, BtcError> {
    match address_type {
        AddressType::Legacy => Ok(Address::p2pkh(pubkey.pubkey_hash(), network.kind())),
        AddressType::Segwit => {
            let compressed = compressed_key(pubkey, address_type)?;
            Ok(Address::p2shwpkh(&compressed, network.kind()))
        }
        AddressType::NativeSegwit => {
            let compressed = compressed_key(pubkey, address_type)?;
            Ok(Address::p2wpkh(&compressed, network.to_bitcoin_network()))
        }
        AddressType::P2wsh | AddressType::P2shP2wsh | AddressType::P2sh => {
            Err(BtcError::IncompatibleAddressType {
                address_type: address_type.to_string(),
                reason: "a single key".into(),
            })
        }
    }
}

fn compressed_key(
    pubkey: &PublicKey,
    address_type: AddressType,
) -> Result<CompressedPublicKey, BtcError> {
    if !pubkey.compressed {
        return Err(BtcError::IncompatibleAddressType {
            address_type: address_type.to_string(),
            reason: "an uncompressed key".into(),
        });
    }
    Ok(CompressedPublicKey(pubkey.inner))
}

/// Parses an address and checks it belongs to `network`.
///
/// Unparseable input fails [`BtcError::InvalidAddress`]; a well-formed
/// address for the other network fails [`BtcError::NetworkMismatch`].
pub fn parse_address(address: &str, network: BtcNetwork) -> Result<Address, BtcError> {
    let parsed = address
        .trim()
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| BtcError::InvalidAddress(format!("failed to parse address: {e}")))?;

    if !parsed.is_valid_for_network(network.to_bitcoin_network()) {
        let other = match network {
            BtcNetwork::Mainnet => BtcNetwork::Testnet,
            BtcNetwork::Testnet => BtcNetwork::Mainnet,
        };
        return Err(BtcError::NetworkMismatch {
            expected: network.to_string(),
            found: other.to_string(),
        });
    }

    Ok(parsed.assume_checked())
}

/// Validate a Bitcoin address string for the given network.
///
/// Returns `true` if the address is valid for `network`, `false` if it is
/// well-formed but for a different network.
pub fn validate_address(address: &str, network: BtcNetwork) -> Result<bool, BtcError> {
    match parse_address(address, network) {
        Ok(_) => Ok(true),
        Err(BtcError::NetworkMismatch { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    /// Public key for the private scalar `1`.
    fn generator_key(compressed: bool) -> PublicKey {
        let secp = Secp256k1::new();
        let mut scalar = [0u8; 32];
        scalar[31] = 1;
        let sk = SecretKey::from_slice(&scalar).unwrap();
        let inner = bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk);
        if compressed {
            PublicKey::new(inner)
        } else {
            PublicKey::new_uncompressed(inner)
        }
    }

    #[test]
    fn one_key_three_encodings() {
        let pk = generator_key(true);
        let legacy = single_sig_address(&pk, AddressType::Legacy, BtcNetwork::Mainnet).unwrap();
        let nested = single_sig_address(&pk, AddressType::Segwit, BtcNetwork::Mainnet).unwrap();
        let native =
            single_sig_address(&pk, AddressType::NativeSegwit, BtcNetwork::Mainnet).unwrap();

        assert_eq!(legacy.to_string(), "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH");
        assert!(nested.to_string().starts_with('3'));
        assert_eq!(
            native.to_string(),
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"
        );
    }

    #[test]
    fn uncompressed_key_only_renders_legacy() {
        let pk = generator_key(false);
        let legacy = single_sig_address(&pk, AddressType::Legacy, BtcNetwork::Mainnet).unwrap();
        assert_eq!(legacy.to_string(), "1EHNa6Q4Jz2uvNExL497mE43ikXhwF6kZm");

        for ty in [AddressType::Segwit, AddressType::NativeSegwit] {
            assert!(matches!(
                single_sig_address(&pk, ty, BtcNetwork::Mainnet),
                Err(BtcError::IncompatibleAddressType { .. })
            ));
        }
    }

    #[test]
    fn multisig_types_are_not_single_key() {
        let pk = generator_key(true);
        assert!(single_sig_address(&pk, AddressType::P2wsh, BtcNetwork::Testnet).is_err());
    }

    #[test]
    fn testnet_prefixes() {
        let pk = generator_key(true);
        let native =
            single_sig_address(&pk, AddressType::NativeSegwit, BtcNetwork::Testnet).unwrap();
        let nested = single_sig_address(&pk, AddressType::Segwit, BtcNetwork::Testnet).unwrap();
        assert!(native.to_string().starts_with("tb1q"));
        assert!(nested.to_string().starts_with('2'));
    }

    #[test]
    fn script_pubkey_lengths_match_rendered_scripts() {
        let pk = generator_key(true);
        for ty in AddressType::SINGLE_SIG {
            let addr = single_sig_address(&pk, ty, BtcNetwork::Testnet).unwrap();
            assert_eq!(addr.script_pubkey().len(), ty.script_pubkey_len(), "{ty}");
        }
    }

    #[test]
    fn parse_rejects_wrong_network() {
        match parse_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", BtcNetwork::Testnet) {
            Err(BtcError::NetworkMismatch { expected, found }) => {
                assert_eq!(expected, "testnet");
                assert_eq!(found, "mainnet");
            }
            other => panic!("expected NetworkMismatch, got {other:?}"),
        }
    }

    #[test]
    fn validate_known_addresses() {
        assert!(validate_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", BtcNetwork::Mainnet).unwrap());
        assert!(
            !validate_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", BtcNetwork::Testnet)
                .unwrap()
        );
        assert!(validate_address("notanaddress!!!", BtcNetwork::Mainnet).is_err());
    }

    #[test]
    fn address_type_names_roundtrip() {
        for ty in [
            AddressType::Legacy,
            AddressType::Segwit,
            AddressType::NativeSegwit,
            AddressType::P2wsh,
            AddressType::P2shP2wsh,
            AddressType::P2sh,
        ] {
            assert_eq!(ty.as_str().parse::<AddressType>().unwrap(), ty);
        }
        assert_eq!("p2wpkh".parse::<AddressType>().unwrap(), AddressType::NativeSegwit);
    }
}

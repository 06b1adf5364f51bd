use bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use bitcoin::PublicKey;
use zeroize::Zeroize;

use crate::error::BtcError;
use crate::network::BtcNetwork;

/// Trailing payload byte marking a key whose public key is compressed.
const COMPRESSION_FLAG: u8 = 0x01;

/// A private key decoded from Wallet Import Format.
///
/// The raw scalar is wiped on drop. `Debug` never prints it.
pub struct WifKey {
    secret: [u8; 32],
    compressed: bool,
    network: BtcNetwork,
}

impl WifKey {
    pub fn new(secret: [u8; 32], compressed: bool, network: BtcNetwork) -> Result<Self, BtcError> {
        SecretKey::from_slice(&secret)
            .map_err(|e| BtcError::InvalidPrivateKey(format!("scalar out of range: {e}")))?;
        Ok(Self {
            secret,
            compressed,
            network,
        })
    }

    /// Decodes a base58check WIF string.
    ///
    /// Accepts a 33-byte payload (uncompressed) or a 34-byte payload ending in
    /// `0x01` (compressed). The version byte selects the network.
    pub fn decode(wif: &str) -> Result<Self, BtcError> {
        let mut payload = bs58::decode(wif.trim())
            .with_check(None)
            .into_vec()
            .map_err(|e| BtcError::InvalidWif(format!("base58check decode failed: {e}")))?;

        let result = Self::from_payload(&payload);
        payload.zeroize();
        result
    }

    fn from_payload(payload: &[u8]) -> Result<Self, BtcError> {
        let compressed = match payload.len() {
            33 => false,
            34 if payload[33] == COMPRESSION_FLAG => true,
            34 => {
                return Err(BtcError::InvalidWif(
                    "unexpected compression flag byte".into(),
                ))
            }
            n => return Err(BtcError::InvalidWif(format!("unexpected payload length {n}"))),
        };

        let network = BtcNetwork::from_wif_version(payload[0])
            .ok_or_else(|| BtcError::InvalidWif(format!("unknown version byte {:#04x}", payload[0])))?;

        let mut secret = [0u8; 32];
        secret.copy_from_slice(&payload[1..33]);
        let key = Self::new(secret, compressed, network).map_err(|_| {
            BtcError::InvalidWif("private key is not a valid secp256k1 scalar".into())
        });
        secret.zeroize();
        key
    }

    /// Encodes back to base58check. Decoding the result yields identical
    /// bytes.
    pub fn encode(&self) -> String {
        let mut payload = Vec::with_capacity(34);
        payload.push(self.network.wif_version());
        payload.extend_from_slice(&self.secret);
        if self.compressed {
            payload.push(COMPRESSION_FLAG);
        }
        let encoded = bs58::encode(&payload).with_check().into_string();
        payload.zeroize();
        encoded
    }

    pub fn secret_key(&self) -> Result<SecretKey, BtcError> {
        SecretKey::from_slice(&self.secret)
            .map_err(|e| BtcError::InvalidPrivateKey(format!("scalar out of range: {e}")))
    }

    pub fn public_key(&self, secp: &Secp256k1<All>) -> Result<PublicKey, BtcError> {
        let inner = bitcoin::secp256k1::PublicKey::from_secret_key(secp, &self.secret_key()?);
        Ok(if self.compressed {
            PublicKey::new(inner)
        } else {
            PublicKey::new_uncompressed(inner)
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn network(&self) -> BtcNetwork {
        self.network
    }
}

impl Drop for WifKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for WifKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WifKey")
            .field("secret", &"[REDACTED]")
            .field("compressed", &self.compressed)
            .field("network", &self.network)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_ONE_COMPRESSED: &str = "KwDiBf89QgGbjEhKnhXJuH7LrciVrZi3qYjgd9M7rFU73sVHnoWn";
    const KEY_ONE_UNCOMPRESSED: &str = "5HpHagT65TZzG1PH3CSu63k8DbpvD8s5ip4nEB3kEsreAnchuDf";

    #[test]
    fn decodes_compressed_mainnet_key() {
        let key = WifKey::decode(KEY_ONE_COMPRESSED).unwrap();
        assert!(key.is_compressed());
        assert_eq!(key.network(), BtcNetwork::Mainnet);
        let mut expected = [0u8; 32];
        expected[31] = 1;
        assert_eq!(key.secret_key().unwrap().secret_bytes(), expected);
    }

    #[test]
    fn decodes_uncompressed_mainnet_key() {
        let key = WifKey::decode(KEY_ONE_UNCOMPRESSED).unwrap();
        assert!(!key.is_compressed());
        let secp = Secp256k1::new();
        assert!(!key.public_key(&secp).unwrap().compressed);
    }

    #[test]
    fn encode_is_byte_exact() {
        for wif in [KEY_ONE_COMPRESSED, KEY_ONE_UNCOMPRESSED] {
            assert_eq!(WifKey::decode(wif).unwrap().encode(), wif);
        }
    }

    #[test]
    fn matches_bitcoin_crate_encoding() {
        let mut scalar = [0u8; 32];
        scalar[0] = 0x42;
        scalar[31] = 0x07;
        let ours = WifKey::new(scalar, true, BtcNetwork::Testnet).unwrap();
        let theirs = bitcoin::PrivateKey::new(
            SecretKey::from_slice(&scalar).unwrap(),
            bitcoin::NetworkKind::Test,
        );
        assert_eq!(ours.encode(), theirs.to_wif());
        assert!(ours.encode().starts_with('c'));
    }

    #[test]
    fn corrupted_checksum_is_invalid_wif() {
        let mut chars: Vec<char> = KEY_ONE_COMPRESSED.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == 'n' { 'm' } else { 'n' };
        let broken: String = chars.into_iter().collect();
        assert!(matches!(WifKey::decode(&broken), Err(BtcError::InvalidWif(_))));
    }

    #[test]
    fn unknown_version_byte_is_rejected() {
        let mut payload = vec![0x00u8];
        payload.extend_from_slice(&[0x11; 32]);
        payload.push(COMPRESSION_FLAG);
        let wif = bs58::encode(&payload).with_check().into_string();
        match WifKey::decode(&wif) {
            Err(BtcError::InvalidWif(msg)) => assert!(msg.contains("version")),
            other => panic!("expected InvalidWif, got {other:?}"),
        }
    }

    #[test]
    fn debug_redacts_secret() {
        let key = WifKey::decode(KEY_ONE_COMPRESSED).unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("0000000000000001"));
    }
}

use std::str::FromStr;

use bitcoin::{Network, NetworkKind};
use serde::{Deserialize, Serialize};

use crate::error::BtcError;

/// WIF version byte for mainnet keys.
pub const MAINNET_WIF_VERSION: u8 = 0x80;

/// WIF version byte for testnet keys.
pub const TESTNET_WIF_VERSION: u8 = 0xef;

/// Supported Bitcoin networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BtcNetwork {
    Mainnet,
    Testnet,
}

impl BtcNetwork {
    /// Convert to the `bitcoin` crate's `Network` type.
    pub fn to_bitcoin_network(self) -> Network {
        match self {
            BtcNetwork::Mainnet => Network::Bitcoin,
            BtcNetwork::Testnet => Network::Testnet,
        }
    }

    pub fn kind(self) -> NetworkKind {
        match self {
            BtcNetwork::Mainnet => NetworkKind::Main,
            BtcNetwork::Testnet => NetworkKind::Test,
        }
    }

    /// BIP44 coin type: `0` on mainnet, `1` on every test network.
    pub fn coin_type(self) -> u32 {
        match self {
            BtcNetwork::Mainnet => 0,
            BtcNetwork::Testnet => 1,
        }
    }

    pub fn wif_version(self) -> u8 {
        match self {
            BtcNetwork::Mainnet => MAINNET_WIF_VERSION,
            BtcNetwork::Testnet => TESTNET_WIF_VERSION,
        }
    }

    pub fn from_wif_version(version: u8) -> Option<Self> {
        match version {
            MAINNET_WIF_VERSION => Some(BtcNetwork::Mainnet),
            TESTNET_WIF_VERSION => Some(BtcNetwork::Testnet),
            _ => None,
        }
    }

    /// Fails with [`BtcError::NetworkMismatch`] unless `other` equals `self`.
    pub fn ensure_matches(self, other: BtcNetwork) -> Result<(), BtcError> {
        if self == other {
            Ok(())
        } else {
            Err(BtcError::NetworkMismatch {
                expected: self.to_string(),
                found: other.to_string(),
            })
        }
    }
}

impl std::fmt::Display for BtcNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BtcNetwork::Mainnet => write!(f, "mainnet"),
            BtcNetwork::Testnet => write!(f, "testnet"),
        }
    }
}

impl FromStr for BtcNetwork {
    type Err = BtcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "bitcoin" | "main" => Ok(BtcNetwork::Mainnet),
            "testnet" | "test" => Ok(BtcNetwork::Testnet),
            other => Err(BtcError::InvalidAddress(format!("unknown network: {other}"))),
        }
    }
}

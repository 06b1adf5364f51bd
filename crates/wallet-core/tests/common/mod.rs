//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use crypto_utils::Argon2Params;
use wallet_core::{AccountId, AddressType, BtcNetwork, CancelToken, EngineConfig, InMemoryBackend, WalletEngine};

pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
pub const SECOND_MNEMONIC: &str =
    "legal winner thank year wave sausage worth useful legal winner thank yellow";
pub const THIRD_MNEMONIC: &str =
    "letter advice cage absurd amount doctor acoustic avoid letter advice cage above";

/// BIP173 testnet P2WPKH vector; not derived from any test mnemonic.
pub const RECIPIENT: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

pub fn config() -> EngineConfig {
    EngineConfig {
        store_kdf: Argon2Params {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        },
        ..EngineConfig::default()
    }
}

pub fn backend() -> Arc<InMemoryBackend> {
    Arc::new(InMemoryBackend::new(BtcNetwork::Testnet))
}

pub fn engine(mnemonic: Option<&str>, backend: &Arc<InMemoryBackend>) -> WalletEngine {
    WalletEngine::create(config(), None, "", mnemonic, backend.clone()).unwrap()
}

/// A native segwit account whose first receive address holds `amounts`,
/// synced into the engine.
pub async fn funded_account(
    engine: &WalletEngine,
    backend: &InMemoryBackend,
    amounts: &[u64],
) -> (AccountId, String) {
    let account = engine
        .create_hd_account("Main", AddressType::NativeSegwit)
        .unwrap();
    let address = engine.allocate_receive_address(account.id).unwrap().address;
    for amount in amounts {
        backend.fund(&address, *amount, 3).unwrap();
    }
    engine.refresh(account.id, CancelToken::new()).await.unwrap();
    (account.id, address)
}

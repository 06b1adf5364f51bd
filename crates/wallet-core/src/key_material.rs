//! Secret key material: the wallet seed, account-level extended private
//! keys, and imported WIF keys.
//!
//! Every holder wipes its secret bytes on drop and redacts them from
//! `Debug`.

use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use chain_btc::wif::WifKey;
use chain_btc::BtcNetwork;
use zeroize::Zeroizing;

use crate::error::WalletError;

/// The BIP39 seed of the wallet.
pub struct SeedKey {
    seed: Zeroizing<[u8; 64]>,
    network: BtcNetwork,
    fingerprint: Fingerprint,
}

impl SeedKey {
    pub fn new(
        seed: Zeroizing<[u8; 64]>,
        network: BtcNetwork,
        secp: &Secp256k1<All>,
    ) -> Result<Self, WalletError> {
        let mut master = master_key(&seed, network)?;
        let fingerprint = master.fingerprint(secp);
        master.private_key.non_secure_erase();
        Ok(Self {
            seed,
            network,
            fingerprint,
        })
    }

    /// Fingerprint of the master public key.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn network(&self) -> BtcNetwork {
        self.network
    }

    pub fn seed_bytes(&self) -> &[u8; 64] {
        &self.seed
    }

    /// Extended private key at `path` below the master.
    pub fn account_key(
        &self,
        path: &DerivationPath,
        secp: &Secp256k1<All>,
    ) -> Result<AccountKey, WalletError> {
        let mut master = master_key(&self.seed, self.network)?;
        let derived = master
            .derive_priv(secp, path)
            .map_err(|e| WalletError::Derivation(format!("derive {path}: {e}")));
        master.private_key.non_secure_erase();
        Ok(AccountKey { xpriv: derived? })
    }

    /// Private key at a full path, for signing.
    pub fn secret_at(
        &self,
        path: &DerivationPath,
        secp: &Secp256k1<All>,
    ) -> Result<SecretKey, WalletError> {
        Ok(self.account_key(path, secp)?.xpriv.private_key)
    }

    /// Extended public key at `path`.
    pub fn xpub_at(
        &self,
        path: &DerivationPath,
        secp: &Secp256k1<All>,
    ) -> Result<Xpub, WalletError> {
        let key = self.account_key(path, secp)?;
        Ok(Xpub::from_priv(secp, &key.xpriv))
    }
}

impl std::fmt::Debug for SeedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedKey")
            .field("seed", &"[REDACTED]")
            .field("network", &self.network)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

fn master_key(seed: &[u8; 64], network: BtcNetwork) -> Result<Xpriv, WalletError> {
    Xpriv::new_master(network.kind(), seed)
        .map_err(|e| WalletError::Derivation(format!("master key: {e}")))
}

/// An extended private key below the master.
pub struct AccountKey {
    xpriv: Xpriv,
}

impl AccountKey {
    pub fn secret_key(&self) -> SecretKey {
        self.xpriv.private_key
    }
}

impl Drop for AccountKey {
    fn drop(&mut self) {
        self.xpriv.private_key.non_secure_erase();
    }
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("xpriv", &"[REDACTED]")
            .field("depth", &self.xpriv.depth)
            .finish()
    }
}

/// Signing material for one account.
#[derive(Debug)]
pub enum KeyMaterial {
    Seed(SeedKey),
    Imported(WifKey),
}

impl KeyMaterial {
    /// Decodes an imported WIF and checks its network.
    pub fn from_wif(wif: &str, network: BtcNetwork) -> Result<Self, WalletError> {
        let key = WifKey::decode(wif)?;
        network.ensure_matches(key.network())?;
        Ok(KeyMaterial::Imported(key))
    }
}

/// Parses a path such as `m/84'/1'/0'`.
pub fn parse_path(path: &str) -> Result<DerivationPath, WalletError> {
    DerivationPath::from_str(path)
        .map_err(|e| WalletError::Derivation(format!("invalid derivation path {path}: {e}")))
}

/// Renders a path as `m/…` with `'` marking hardened steps.
pub fn format_path(path: &DerivationPath) -> String {
    let mut out = String::from("m");
    for child in path.as_ref() {
        out.push('/');
        out.push_str(&child.to_string());
    }
    out
}

use bip39::{Language, Mnemonic};
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use crate::error::WalletError;

/// Generate a new BIP-39 mnemonic of 12 or 24 words.
pub fn generate_mnemonic(word_count: usize) -> Result<Zeroizing<String>, WalletError> {
    let entropy_len = match word_count {
        12 => 16,
        24 => 32,
        n => {
            return Err(WalletError::InvalidMnemonic(format!(
                "unsupported word count {n}, expected 12 or 24"
            )))
        }
    };
    let mut entropy = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut entropy[..entropy_len]);
    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy[..entropy_len])
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()));
    entropy.zeroize();
    Ok(Zeroizing::new(mnemonic?.to_string()))
}

/// Derive the 64-byte BIP-39 seed from a mnemonic and optional passphrase.
pub fn mnemonic_to_seed(phrase: &str, passphrase: &str) -> Result<Zeroizing<[u8; 64]>, WalletError> {
    let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
    Ok(Zeroizing::new(mnemonic.to_seed(passphrase)))
}

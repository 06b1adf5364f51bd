//! Engine configuration.
//!
//! [`EngineConfig`] has working defaults for every field and can be loaded
//! from a JSON file; missing fields fall back to the defaults. The receive
//! gap limit is deliberately absent: it is a constant.

use std::path::Path;

use chain_btc::BtcNetwork;
use crypto_utils::{Argon2Params, MIN_PBKDF2_ITERATIONS};
use serde::{Deserialize, Serialize};

use crate::backup::MAX_BACKUP_ITERATIONS;
use crate::error::WalletError;
use crate::types::PrivacySettings;

/// Random delay applied before each external query when timing jitter is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingJitterConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Cumulative budget for one refresh; exceeding it stops the refresh
    /// with the results gathered so far.
    pub timeout_secs: u64,
}

impl Default for TimingJitterConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1_000,
            max_delay_ms: 5_000,
            timeout_secs: 60,
        }
    }
}

/// Window for delayed broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastDelayConfig {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl Default for BroadcastDelayConfig {
    fn default() -> Self {
        Self {
            min_secs: 5,
            max_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub network: BtcNetwork,
    /// UTXOs with fewer confirmations are not spent.
    pub min_confirmations: u32,
    pub dust_threshold_sat: u64,
    pub max_inputs: usize,
    pub max_fee_sat: u64,
    /// PBKDF2 rounds for encrypted key backups.
    pub pbkdf2_iterations: u32,
    /// Argon2id cost for the store key.
    pub store_kdf: Argon2Params,
    /// Initial privacy settings for a new store. An existing store keeps
    /// its persisted settings.
    pub privacy: PrivacySettings,
    pub timing_jitter: TimingJitterConfig,
    pub broadcast_delay: BroadcastDelayConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: BtcNetwork::Testnet,
            min_confirmations: 1,
            dust_threshold_sat: 546,
            max_inputs: 100,
            max_fee_sat: 1_000_000,
            pbkdf2_iterations: MIN_PBKDF2_ITERATIONS,
            store_kdf: Argon2Params::default(),
            privacy: PrivacySettings::default(),
            timing_jitter: TimingJitterConfig::default(),
            broadcast_delay: BroadcastDelayConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, WalletError> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| WalletError::Internal(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, WalletError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), WalletError> {
        if self.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(WalletError::Unsupported(format!(
                "pbkdf2_iterations {} is below the minimum of {MIN_PBKDF2_ITERATIONS}",
                self.pbkdf2_iterations
            )));
        }
        if self.pbkdf2_iterations > MAX_BACKUP_ITERATIONS {
            return Err(WalletError::Unsupported(format!(
                "pbkdf2_iterations {} is above the maximum of {MAX_BACKUP_ITERATIONS}",
                self.pbkdf2_iterations
            )));
        }
        if self.max_inputs == 0 {
            return Err(WalletError::Internal("max_inputs must be at least 1".into()));
        }
        let t = &self.timing_jitter;
        if t.min_delay_ms > t.max_delay_ms {
            return Err(WalletError::Internal(
                "timing_jitter.min_delay_ms exceeds max_delay_ms".into(),
            ));
        }
        let d = &self.broadcast_delay;
        if d.min_secs > d.max_secs {
            return Err(WalletError::Internal(
                "broadcast_delay.min_secs exceeds max_secs".into(),
            ));
        }
        Ok(())
    }
}

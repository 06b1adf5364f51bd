//! Privacy policy: amount suggestions, query timing jitter and broadcast
//! delay selection.
//!
//! Each feature is gated by its own flag in [`PrivacySettings`]. With every
//! flag off the engine behaves as if this module did not exist.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{BroadcastDelayConfig, TimingJitterConfig};
use crate::types::PrivacySettings;

/// Largest relative change `suggest_amount` makes, in parts per million.
pub const MAX_VARIANCE_PPM: u64 = 1_000;

/// Amounts that are a multiple of this (at most three BTC decimals) are
/// considered round.
const ROUND_UNIT_SAT: u64 = 100_000;

const SUGGESTION_ATTEMPTS: usize = 32;

pub fn is_round_amount(sats: u64) -> bool {
    sats > 0 && sats % ROUND_UNIT_SAT == 0
}

/// A nearby amount that does not look hand-picked.
///
/// The result differs from `sats` by at least one satoshi and at most
/// [`MAX_VARIANCE_PPM`], is never round and never below
/// `dust_threshold_sat`. Returns `None` when no such amount exists, e.g.
/// for amounts too small to perturb.
pub fn suggest_amount<R: Rng + ?Sized>(
    sats: u64,
    dust_threshold_sat: u64,
    rng: &mut R,
) -> Option<u64> {
    let max_delta = (u128::from(sats) * u128::from(MAX_VARIANCE_PPM) / 1_000_000) as u64;
    if max_delta == 0 {
        return None;
    }
    for _ in 0..SUGGESTION_ATTEMPTS {
        let delta = rng.gen_range(1..=max_delta);
        let candidate = if rng.gen_bool(0.5) {
            sats.checked_add(delta)?
        } else {
            sats - delta
        };
        if candidate >= dust_threshold_sat && !is_round_amount(candidate) {
            return Some(candidate);
        }
    }
    None
}

/// The amount a transaction should actually pay.
///
/// Only round amounts are perturbed, only with amount jitter on, and only
/// when the caller has not opted out for this transaction.
pub fn apply_amount_jitter<R: Rng + ?Sized>(
    settings: &PrivacySettings,
    opt_out: bool,
    sats: u64,
    dust_threshold_sat: u64,
    rng: &mut R,
) -> u64 {
    if !settings.amount_jitter || opt_out || !is_round_amount(sats) {
        return sats;
    }
    match suggest_amount(sats, dust_threshold_sat, rng) {
        Some(adjusted) => {
            tracing::debug!(requested = sats, adjusted, "amount jitter applied");
            adjusted
        }
        None => sats,
    }
}

/// Delay before a scheduled broadcast, in seconds.
pub fn broadcast_delay_secs<R: Rng + ?Sized>(config: &BroadcastDelayConfig, rng: &mut R) -> u64 {
    rng.gen_range(config.min_secs..=config.max_secs)
}

/// Cooperative cancellation shared between a caller and a long-running
/// task.
#[derive(Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// True when both handles belong to the same token.
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.sender, &other.sender)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Why a sequence of queries stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interrupted {
    /// The cumulative time budget ran out.
    Deadline,
    Cancelled,
}

/// Paces a sequence of external queries.
///
/// With timing jitter on, every query waits a random delay first. The whole
/// sequence shares one time budget; once the next delay would overrun it,
/// the sequence stops and the caller keeps the results it has. With it off,
/// queries run back to back with no budget; only cancellation stops them.
pub struct TimingJitter {
    enabled: bool,
    min_delay_ms: u64,
    max_delay_ms: u64,
    budget: Duration,
    started: Instant,
    token: CancelToken,
    rng: StdRng,
}

impl TimingJitter {
    pub fn new(enabled: bool, config: &TimingJitterConfig, token: CancelToken) -> Self {
        Self::with_rng(enabled, config, token, StdRng::from_entropy())
    }

    pub fn with_rng(
        enabled: bool,
        config: &TimingJitterConfig,
        token: CancelToken,
        rng: StdRng,
    ) -> Self {
        Self {
            enabled,
            min_delay_ms: config.min_delay_ms,
            max_delay_ms: config.max_delay_ms,
            budget: Duration::from_secs(config.timeout_secs),
            started: Instant::now(),
            token,
            rng,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Waits before the next query.
    pub async fn before_query(&mut self) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        if !self.enabled {
            return Ok(());
        }
        let elapsed = self.started.elapsed();
        if elapsed >= self.budget {
            return Err(Interrupted::Deadline);
        }

        let delay = Duration::from_millis(self.rng.gen_range(self.min_delay_ms..=self.max_delay_ms));
        if elapsed + delay > self.budget {
            tracing::debug!(?elapsed, ?delay, "query budget exhausted");
            return Err(Interrupted::Deadline);
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.token.cancelled() => Err(Interrupted::Cancelled),
        }
    }
}

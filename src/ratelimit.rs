//! Per-tier admission control for calls to the judgment service.
//!
//! Each tier is a token bucket refilled continuously at
//! `requests_per_interval / interval`, plus a cap on concurrent calls.
//! Waiters are served in arrival order: the in-flight semaphore and the
//! refill mutex are both FIFO in tokio.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use sysrev_common::Tier;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TierConfig;
use crate::errors::RateLimitError;

/// Permission to make one call. The in-flight slot is released on drop.
#[derive(Debug)]
pub struct Ticket {
    tier: Tier,
    _permit: OwnedSemaphorePermit,
}

impl Ticket {
    pub fn tier(&self) -> &Tier {
        &self.tier
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

struct TierBucket {
    tier: Tier,
    capacity: f64,
    per_second: f64,
    max_in_flight: usize,
    in_flight: Arc<Semaphore>,
    state: Mutex<BucketState>,
}

impl TierBucket {
    fn new(tier: Tier, config: &TierConfig) -> Self {
        let capacity = f64::from(config.requests_per_interval.max(1));
        let interval = config.interval().as_secs_f64().max(f64::EPSILON);
        Self {
            tier,
            capacity,
            per_second: capacity / interval,
            max_in_flight: config.max_in_flight.max(1),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    async fn acquire(&self) -> Result<Ticket, RateLimitError> {
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RateLimitError::Cancelled(self.tier.clone()))?;

        // Holding the lock while sleeping keeps later arrivals queued behind us.
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.per_second).min(self.capacity);
            state.last_refill = now;

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return Ok(Ticket {
                    tier: self.tier.clone(),
                    _permit: permit,
                });
            }

            let wait = Duration::from_secs_f64((1.0 - state.tokens) / self.per_second);
            debug!(tier = %self.tier, ?wait, "Rate limit reached, waiting for refill");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Shared limiter; clone freely.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<HashMap<Tier, TierBucket>>,
}

impl RateLimiter {
    pub fn new(tiers: &BTreeMap<String, TierConfig>) -> Self {
        let buckets = tiers
            .iter()
            .map(|(name, config)| {
                let tier = Tier::new(name);
                (tier.clone(), TierBucket::new(tier, config))
            })
            .collect();
        Self {
            buckets: Arc::new(buckets),
        }
    }

    /// Wait for a ticket on `tier`.
    ///
    /// Returns `Cancelled` as soon as `cancel` fires; a cancelled wait never
    /// consumes a token or holds an in-flight slot.
    pub async fn reserve(
        &self,
        tier: &Tier,
        cancel: &CancellationToken,
    ) -> Result<Ticket, RateLimitError> {
        let bucket = self
            .buckets
            .get(tier)
            .ok_or_else(|| RateLimitError::UnknownTier(tier.clone()))?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RateLimitError::Cancelled(tier.clone())),
            ticket = bucket.acquire() => ticket,
        }
    }

    /// Calls currently holding a ticket on `tier`.
    pub fn in_flight(&self, tier: &Tier) -> usize {
        self.buckets
            .get(tier)
            .map(|b| b.max_in_flight - b.in_flight.available_permits())
            .unwrap_or(0)
    }
}

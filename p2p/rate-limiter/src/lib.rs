//! # Rate Limiter
//!
//! Token buckets per (peer, message type), shared by outbound requests and inbound admission.
//!
//! A request costs as many tokens as it names items. Outbound tokens are taken as a
//! [`QuotaPermit`], which gives the tokens back when dropped unless it was marked
//! [`dispatched`](QuotaPermit::dispatched): tokens are only refunded when a request never reached
//! the wire.
//!
//! Every withdraw and refund happens under the bucket's map shard lock, concurrent withdrawals
//! never spend the same token twice.
use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use beacon_wire::{MessageType, PeerId};

mod config;

pub use config::{Quota, RateLimiterConfig};

/// An error taking tokens from a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// The request costs more than the bucket can ever hold.
    #[error("request cost {cost} exceeds the bucket capacity {capacity}")]
    CostExceedsCapacity { cost: u64, capacity: u64 },
    /// The bucket does not hold enough tokens right now.
    #[error("quota exhausted, retry after {retry_after:?}")]
    Exhausted { retry_after: Duration },
}

/// What an outbound request does when its bucket is short of tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundPolicy {
    /// Fail immediately.
    #[default]
    FailFast,
    /// Wait for the bucket to refill, for at most `max_wait`.
    Backoff { max_wait: Duration },
}

/// Tokens are tracked in thousandths so slow refill rates still refill every millisecond.
const MILLIS_PER_TOKEN: u64 = 1_000;

#[derive(Debug)]
struct Bucket {
    /// Available thousandths of a token.
    available: u64,
    last_refill: Instant,
}

impl Bucket {
    const fn full(quota: Quota, now: Instant) -> Self {
        Self {
            available: quota.capacity.saturating_mul(MILLIS_PER_TOKEN),
            last_refill: now,
        }
    }

    fn refill(&mut self, quota: Quota, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        if elapsed_ms == 0 {
            return;
        }

        // refill_per_second tokens per 1000 ms is refill_per_second thousandths per ms.
        let added = quota.refill_per_second.saturating_mul(elapsed_ms);
        self.available = self
            .available
            .saturating_add(added)
            .min(quota.capacity.saturating_mul(MILLIS_PER_TOKEN));
        // Only whole milliseconds were credited, the remainder counts towards the next refill.
        self.last_refill = self
            .last_refill
            .checked_add(Duration::from_millis(elapsed_ms))
            .unwrap_or(now);
    }

    /// Takes `cost` tokens or returns how long until they are available.
    fn withdraw(&mut self, quota: Quota, cost: u64, now: Instant) -> Result<(), Duration> {
        self.refill(quota, now);

        let cost = cost.saturating_mul(MILLIS_PER_TOKEN);
        if cost <= self.available {
            self.available -= cost;
            return Ok(());
        }

        if quota.refill_per_second == 0 {
            return Err(Duration::MAX);
        }
        let deficit = cost - self.available;
        Err(Duration::from_millis(deficit.div_ceil(quota.refill_per_second)))
    }

    fn deposit(&mut self, quota: Quota, cost: u64) {
        self.available = self
            .available
            .saturating_add(cost.saturating_mul(MILLIS_PER_TOKEN))
            .min(quota.capacity.saturating_mul(MILLIS_PER_TOKEN));
    }
}

struct Inner<P: PeerId> {
    buckets: DashMap<(P, MessageType), Bucket>,
    config: RateLimiterConfig,
}

/// The rate limiter, cheap to clone.
pub struct RateLimiter<P: PeerId> {
    inner: Arc<Inner<P>>,
}

impl<P: PeerId> Clone for RateLimiter<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: PeerId> RateLimiter<P> {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                buckets: DashMap::new(),
                config,
            }),
        }
    }

    /// Takes `cost` tokens from the bucket of `peer` and `message_type`, creating a full bucket on
    /// first contact.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] if the bucket doesn't hold `cost` tokens.
    pub fn try_withdraw(
        &self,
        peer: &P,
        message_type: MessageType,
        cost: u64,
    ) -> Result<QuotaPermit<P>, RateLimitError> {
        let quota = self.inner.config.quota(message_type);
        if cost > quota.capacity {
            return Err(RateLimitError::CostExceedsCapacity {
                cost,
                capacity: quota.capacity,
            });
        }

        let now = Instant::now();
        let mut bucket = self
            .inner
            .buckets
            .entry((peer.clone(), message_type))
            .or_insert_with(|| Bucket::full(quota, now));

        match bucket.withdraw(quota, cost, now) {
            Ok(()) => Ok(QuotaPermit {
                limiter: self.clone(),
                key: Some((peer.clone(), message_type)),
                cost,
            }),
            Err(retry_after) => {
                tracing::trace!(?peer, %message_type, cost, "quota exhausted");
                Err(RateLimitError::Exhausted { retry_after })
            }
        }
    }

    /// Takes `cost` tokens, waiting for them according to `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] if the tokens are not available in time.
    pub async fn acquire(
        &self,
        peer: &P,
        message_type: MessageType,
        cost: u64,
        policy: OutboundPolicy,
    ) -> Result<QuotaPermit<P>, RateLimitError> {
        let OutboundPolicy::Backoff { max_wait } = policy else {
            return self.try_withdraw(peer, message_type, cost);
        };

        let deadline = Instant::now() + max_wait;
        loop {
            match self.try_withdraw(peer, message_type, cost) {
                Err(RateLimitError::Exhausted { retry_after })
                    if Instant::now()
                        .checked_add(retry_after)
                        .is_some_and(|ready| ready <= deadline) =>
                {
                    tracing::debug!(?peer, %message_type, ?retry_after, "backing off for quota");
                    tokio::time::sleep(retry_after).await;
                }
                res => return res,
            }
        }
    }

    /// Admits an inbound request of `cost` items from `peer`.
    ///
    /// Inbound tokens are never refunded.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] if the request is over quota.
    pub fn inbound_admit(
        &self,
        peer: &P,
        message_type: MessageType,
        cost: u64,
    ) -> Result<(), RateLimitError> {
        self.try_withdraw(peer, message_type, cost)
            .map(QuotaPermit::dispatched)
    }

    /// Returns `true` if the bucket of `peer` and `message_type` holds at least one token.
    pub fn has_tokens(&self, peer: &P, message_type: MessageType) -> bool {
        let quota = self.inner.config.quota(message_type);
        let now = Instant::now();
        let Some(mut bucket) = self.inner.buckets.get_mut(&(peer.clone(), message_type)) else {
            // A new bucket starts full.
            return quota.capacity > 0;
        };
        bucket.refill(quota, now);
        bucket.available >= MILLIS_PER_TOKEN
    }

    /// Drops every bucket of `peer`.
    pub fn evict_peer(&self, peer: &P) {
        self.inner.buckets.retain(|(p, _), _| p != peer);
        tracing::debug!(?peer, "evicted peer quotas");
    }

    /// Returns the amount of whole tokens in the bucket of `peer` and `message_type`.
    pub fn available(&self, peer: &P, message_type: MessageType) -> u64 {
        let quota = self.inner.config.quota(message_type);
        self.inner
            .buckets
            .get_mut(&(peer.clone(), message_type))
            .map_or(quota.capacity, |mut bucket| {
                bucket.refill(quota, Instant::now());
                bucket.available / MILLIS_PER_TOKEN
            })
    }

    fn refund(&self, key: &(P, MessageType), cost: u64) {
        let quota = self.inner.config.quota(key.1);
        if let Some(mut bucket) = self.inner.buckets.get_mut(key) {
            bucket.deposit(quota, cost);
        }
    }
}

/// Tokens taken for an outbound request.
///
/// Dropping the permit refunds the tokens, unless [`QuotaPermit::dispatched`] was called.
#[must_use = "dropping a permit refunds its tokens"]
pub struct QuotaPermit<P: PeerId> {
    limiter: RateLimiter<P>,
    /// Set to [`None`] once the tokens are spent or refunded.
    key: Option<(P, MessageType)>,
    cost: u64,
}

impl<P: PeerId> QuotaPermit<P> {
    /// The amount of tokens this permit holds.
    pub const fn cost(&self) -> u64 {
        self.cost
    }

    /// Marks the request as sent, its tokens are spent for good.
    pub fn dispatched(mut self) {
        self.key = None;
    }

    /// Gives the tokens back.
    pub fn refund(mut self) {
        if let Some(key) = self.key.take() {
            self.limiter.refund(&key, self.cost);
        }
    }
}

impl<P: PeerId> Drop for QuotaPermit<P> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.limiter.refund(&key, self.cost);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn limiter(capacity: u64, refill_per_second: u64) -> RateLimiter<u32> {
        RateLimiter::new(RateLimiterConfig {
            quotas: BTreeMap::from([(
                MessageType::BlocksByRoot,
                Quota::new(capacity, refill_per_second),
            )]),
        })
    }

    #[test]
    fn cost_over_capacity() {
        let limiter = limiter(10, 1);
        assert!(matches!(
            limiter.try_withdraw(&1, MessageType::BlocksByRoot, 11),
            Err(RateLimitError::CostExceedsCapacity { cost: 11, capacity: 10 })
        ));
    }

    #[test]
    fn dropped_permit_refunds() {
        let limiter = limiter(10, 0);
        let permit = limiter
            .try_withdraw(&1, MessageType::BlocksByRoot, 7)
            .unwrap();
        assert_eq!(limiter.available(&1, MessageType::BlocksByRoot), 3);
        drop(permit);
        assert_eq!(limiter.available(&1, MessageType::BlocksByRoot), 10);

        limiter
            .try_withdraw(&1, MessageType::BlocksByRoot, 7)
            .unwrap()
            .dispatched();
        assert_eq!(limiter.available(&1, MessageType::BlocksByRoot), 3);
    }

    #[test]
    fn buckets_are_per_peer_and_type() {
        let limiter = limiter(2, 0);
        limiter
            .inbound_admit(&1, MessageType::BlocksByRoot, 2)
            .unwrap();
        assert!(!limiter.has_tokens(&1, MessageType::BlocksByRoot));
        assert!(limiter.has_tokens(&2, MessageType::BlocksByRoot));
        assert!(limiter.has_tokens(&1, MessageType::BlocksByRange));

        limiter.evict_peer(&1);
        assert!(limiter.has_tokens(&1, MessageType::BlocksByRoot));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time() {
        let limiter = limiter(10, 2);
        limiter
            .inbound_admit(&1, MessageType::BlocksByRoot, 10)
            .unwrap();

        let Err(RateLimitError::Exhausted { retry_after }) =
            limiter.try_withdraw(&1, MessageType::BlocksByRoot, 3)
        else {
            panic!("bucket should be empty");
        };
        assert_eq!(retry_after, Duration::from_millis(1_500));

        tokio::time::advance(Duration::from_millis(1_500)).await;
        limiter
            .try_withdraw(&1, MessageType::BlocksByRoot, 3)
            .unwrap()
            .dispatched();
    }

    #[tokio::test(start_paused = true)]
    async fn frequent_refills_keep_partial_milliseconds() {
        let limiter = limiter(10, 2);
        limiter
            .inbound_admit(&1, MessageType::BlocksByRoot, 10)
            .unwrap();

        let mut tokens = 0;
        for _ in 0..1_000 {
            tokio::time::advance(Duration::from_micros(1_500)).await;
            tokens = limiter.available(&1, MessageType::BlocksByRoot);
        }

        // 1.5 s at 2 tokens per second.
        assert_eq!(tokens, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_for_tokens() {
        let limiter = limiter(4, 4);
        limiter
            .inbound_admit(&1, MessageType::BlocksByRoot, 4)
            .unwrap();

        let start = Instant::now();
        limiter
            .acquire(
                &1,
                MessageType::BlocksByRoot,
                2,
                OutboundPolicy::Backoff {
                    max_wait: Duration::from_secs(1),
                },
            )
            .await
            .unwrap()
            .dispatched();
        assert_eq!(start.elapsed(), Duration::from_millis(500));

        assert!(limiter
            .acquire(&1, MessageType::BlocksByRoot, 4, OutboundPolicy::FailFast)
            .await
            .is_err());
        assert!(limiter
            .acquire(
                &1,
                MessageType::BlocksByRoot,
                4,
                OutboundPolicy::Backoff {
                    max_wait: Duration::from_millis(100)
                },
            )
            .await
            .is_err());
    }
}

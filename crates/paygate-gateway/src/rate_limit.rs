//! Token-bucket rate limiting with per-key isolation and tiered policies.
//!
//! Buckets live in a sharded [`DashMap`], so every operation on a key holds
//! that key's shard lock for its whole read-modify-write and keys in
//! different shards never contend. Buckets start full, refill continuously
//! at `rpm / 60` tokens per second (computed lazily on each access) and are
//! removed by a background sweep once idle for longer than the cleanup TTL.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{RateLimitConfig, TierPolicy};

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_access: now,
        }
    }

    /// Tokens the bucket would hold at `now`, without mutating it.
    fn projected(&self, now: Instant, rate: f64, capacity: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * rate).min(capacity)
    }

    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        self.tokens = self.projected(now, rate, capacity);
        self.last_refill = now;
    }
}

/// Per-key token bucket limiter.
#[derive(Debug)]
pub struct TokenBucket {
    buckets: DashMap<String, Bucket>,
    rpm: u32,
    capacity: f64,
    /// Tokens per second.
    rate: f64,
}

impl TokenBucket {
    pub fn new(policy: TierPolicy) -> Self {
        Self {
            buckets: DashMap::new(),
            rpm: policy.rpm,
            capacity: f64::from(policy.burst),
            rate: f64::from(policy.rpm) / 60.0,
        }
    }

    /// Configured requests per minute, reported as `X-RateLimit-Limit`.
    pub fn limit(&self) -> u32 {
        self.rpm
    }

    pub fn admit(&self, key: &str) -> bool {
        self.admit_n(key, 1)
    }

    /// Take `n` tokens at once, or none.
    pub fn admit_n(&self, key: &str, n: u32) -> bool {
        let now = Instant::now();
        let needed = f64::from(n);
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::full(self.capacity, now));
        bucket.refill(now, self.rate, self.capacity);
        bucket.last_access = now;
        if bucket.tokens >= needed {
            bucket.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available. Unknown keys report full capacity.
    pub fn remaining(&self, key: &str) -> u64 {
        let now = Instant::now();
        match self.buckets.get(key) {
            Some(bucket) => bucket.projected(now, self.rate, self.capacity).floor() as u64,
            None => self.capacity as u64,
        }
    }

    /// Unix second at which the bucket will be full again.
    pub fn reset_time(&self, key: &str) -> i64 {
        let now_unix = chrono::Utc::now().timestamp();
        let tokens = match self.buckets.get(key) {
            Some(bucket) => bucket.projected(Instant::now(), self.rate, self.capacity),
            None => return now_unix,
        };
        let deficit = self.capacity - tokens;
        if deficit <= 0.0 || self.rate <= 0.0 {
            return now_unix;
        }
        now_unix + (deficit / self.rate).ceil() as i64
    }

    /// Seconds a rejected caller should wait, never less than one.
    pub fn retry_after(&self, key: &str) -> i64 {
        (self.reset_time(key) - chrono::Utc::now().timestamp()).max(1)
    }

    /// Drop buckets not touched for longer than `idle_ttl`.
    pub fn sweep(&self, idle_ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last_access) <= idle_ttl);
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }

    /// Spawn the idle-bucket sweep. Runs every `idle_ttl` and exits once the
    /// limiter has been dropped.
    pub fn start_sweeper(self: &Arc<Self>, idle_ttl: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(idle_ttl);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let removed = limiter.sweep(idle_ttl);
                if removed > 0 {
                    tracing::debug!(removed, remaining = limiter.len(), "swept idle rate-limit buckets");
                }
            }
        })
    }
}

/// Rate-limit tier a request is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// No payment headers; keyed by client IP.
    Anonymous,
    /// Signature and nonce present; keyed by the nonce.
    Standard,
    /// Reserved for payers with a verified history.
    Verified,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Standard => "standard",
            Tier::Verified => "verified",
        }
    }
}

/// Outcome of one admission check, with the values for the `X-RateLimit-*`
/// headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub tier: Tier,
    pub limit: u32,
    pub remaining: u64,
    pub reset: i64,
    pub retry_after: i64,
}

/// One [`TokenBucket`] per tier plus key derivation.
pub struct TieredRateLimiter {
    anonymous: Arc<TokenBucket>,
    standard: Arc<TokenBucket>,
    verified: Arc<TokenBucket>,
    key_salt: String,
}

impl TieredRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            anonymous: Arc::new(TokenBucket::new(config.anonymous)),
            standard: Arc::new(TokenBucket::new(config.standard)),
            verified: Arc::new(TokenBucket::new(config.verified)),
            key_salt: config.key_salt.clone(),
        }
    }

    pub fn bucket(&self, tier: Tier) -> &Arc<TokenBucket> {
        match tier {
            Tier::Anonymous => &self.anonymous,
            Tier::Standard => &self.standard,
            Tier::Verified => &self.verified,
        }
    }

    /// Pick the tier and bucket key for a request.
    ///
    /// The nonce only becomes the key when a signature is present as well;
    /// otherwise anyone could dodge the IP limit by inventing nonces.
    pub fn classify(
        &self,
        signature: Option<&str>,
        nonce: Option<&str>,
        client_ip: &str,
    ) -> (Tier, String) {
        match (signature, nonce) {
            (Some(sig), Some(nonce)) if !sig.is_empty() && !nonce.is_empty() => {
                let mut hasher = Sha256::new();
                hasher.update(self.key_salt.as_bytes());
                hasher.update(nonce.as_bytes());
                let digest = alloy::hex::encode(hasher.finalize());
                (Tier::Standard, format!("nonce:{}", &digest[..32]))
            }
            _ => (Tier::Anonymous, format!("ip:{client_ip}")),
        }
    }

    pub fn check(&self, tier: Tier, key: &str) -> RateDecision {
        let bucket = self.bucket(tier);
        let allowed = bucket.admit(key);
        RateDecision {
            allowed,
            tier,
            limit: bucket.limit(),
            remaining: if allowed { bucket.remaining(key) } else { 0 },
            reset: bucket.reset_time(key),
            retry_after: bucket.retry_after(key),
        }
    }

    /// Total live buckets across tiers.
    pub fn bucket_count(&self) -> usize {
        self.anonymous.len() + self.standard.len() + self.verified.len()
    }

    pub fn start_sweepers(&self, idle_ttl: Duration) -> Vec<JoinHandle<()>> {
        [&self.anonymous, &self.standard, &self.verified]
            .into_iter()
            .map(|bucket| bucket.start_sweeper(idle_ttl))
            .collect()
    }
}

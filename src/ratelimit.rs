//! Per-IP rate limiting using the token bucket algorithm.
//!
//! Each source IP owns an independent bucket that refills continuously at the
//! configured rate and is drained by one token per admitted action. The map
//! lock is only held to find or create a bucket; refill and consume happen
//! under the bucket's own mutex, so saturated IPs never slow down others.
//!
//! A rate of zero disables limiting entirely and no buckets are created.

use crate::config::RateLimiterConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Token bucket for rate limiting.
#[derive(Debug)]
struct TokenBucket {
    /// Current number of available tokens.
    tokens: f64,
    /// Maximum capacity of the bucket.
    capacity: f64,
    /// Rate at which tokens are added (per second).
    refill_rate: f64,
    /// Last time the bucket was refilled.
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Refills tokens based on elapsed time.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Attempts to consume a token.
    ///
    /// Returns `true` if a token was consumed, `false` if the bucket is empty.
    /// The refill is kept either way.
    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Returns the estimated wait time until a token is available.
    ///
    /// `Duration::MAX` when the capacity is below one token, since no wait
    /// will ever make a token available.
    fn wait_time(&self, now: Instant) -> Duration {
        if self.capacity < 1.0 {
            return Duration::MAX;
        }

        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        if tokens >= 1.0 || self.refill_rate <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - tokens) / self.refill_rate)
        }
    }

    /// Returns `true` when the bucket has refilled to capacity and has not
    /// been touched for longer than `idle`.
    fn is_idle_full(&self, now: Instant, idle: Duration) -> bool {
        let since = now.saturating_duration_since(self.last_refill);
        since > idle
            && self.tokens + since.as_secs_f64() * self.refill_rate >= self.capacity
    }
}

/// Per-source-IP token bucket rate limiter.
pub struct TokenBucketLimiter {
    config: RateLimiterConfig,
    buckets: DashMap<IpAddr, Arc<Mutex<TokenBucket>>>,
}

impl TokenBucketLimiter {
    /// Creates a new rate limiter with the given configuration.
    pub fn new(config: RateLimiterConfig) -> Self {
        if config.rate > 0 && config.capacity == 0 {
            warn!(
                rate = config.rate,
                "rate limiter capacity is zero, every request will be rejected"
            );
        }

        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Creates a rate limiter with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    /// Returns `true` if `ip` may act now, consuming one token.
    pub fn allow(&self, ip: IpAddr) -> bool {
        if self.config.is_unlimited() {
            return true;
        }

        let ip = ip.to_canonical();
        let bucket = self.bucket(ip);
        let allowed = bucket.lock().try_consume(Instant::now());
        if !allowed {
            debug!(ip = %ip, "per-ip rate limit exceeded");
        }
        allowed
    }

    /// Returns the estimated wait before `ip` has a token available.
    ///
    /// Zero when limiting is disabled, the IP has never been seen, or a
    /// token is already available. `Duration::MAX` when the configured
    /// capacity is zero.
    pub fn retry_after(&self, ip: IpAddr) -> Duration {
        if self.config.is_unlimited() {
            return Duration::ZERO;
        }

        if self.config.capacity == 0 {
            return Duration::MAX;
        }

        match self.buckets.get(&ip.to_canonical()) {
            Some(entry) => {
                let bucket = Arc::clone(entry.value());
                drop(entry);
                let wait = bucket.lock().wait_time(Instant::now());
                wait
            }
            None => Duration::ZERO,
        }
    }

    /// Removes buckets idle for longer than `idle` that have refilled to
    /// capacity, returning how many were removed.
    ///
    /// A removed bucket is re-seeded full on next use, so pruning never
    /// changes an admission decision. The limiter never calls this itself;
    /// scheduling a sweep is up to the owner.
    pub fn prune_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        // A bucket cloned out by `allow` but not yet locked has a second
        // strong reference. Clones only happen under the shard lock, which
        // `retain` holds for writing, so the count cannot grow here.
        self.buckets.retain(|_, bucket| {
            let prune =
                Arc::strong_count(bucket) == 1 && bucket.lock().is_idle_full(now, idle);
            if prune {
                removed += 1;
            }
            !prune
        });

        if removed > 0 {
            debug!(removed, "pruned idle rate limit buckets");
        }
        removed
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Returns the current statistics.
    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            tracked_ips: self.buckets.len(),
            rate: self.config.rate,
            capacity: self.config.capacity,
        }
    }

    /// Looks up or lazily creates the bucket for an already canonical IP.
    fn bucket(&self, ip: IpAddr) -> Arc<Mutex<TokenBucket>> {
        let capacity = self.config.capacity as f64;
        let rate = self.config.rate as f64;
        self.buckets
            .entry(ip)
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(capacity, rate))))
            .clone()
    }
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("config", &self.config)
            .field("tracked_ips", &self.buckets.len())
            .finish()
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStats {
    /// Number of IPs with a bucket.
    pub tracked_ips: usize,
    /// Configured tokens per second.
    pub rate: u64,
    /// Configured bucket capacity.
    pub capacity: u64,
}

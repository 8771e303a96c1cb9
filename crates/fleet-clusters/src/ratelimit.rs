//! Keyed token-bucket rate limiting
//!
//! Every key gets its own bucket, created full. The number of tracked keys is
//! bounded; inserting a key at capacity evicts the least recently used one,
//! which starts over with a full bucket if it comes back.
//!
//! The key index is locked only long enough to find or insert a bucket. Each
//! bucket has its own lock, so hot keys never serialize unrelated ones.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_common::config::RateLimitConfig;
use fleet_common::{Error, Result};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Sustained rate and burst applied to each key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateQuota {
    /// Tokens added per second
    pub per_second: u32,
    /// Bucket capacity
    pub burst: u32,
}

impl RateQuota {
    /// Quota allowing `n` events per second with a burst of `n`
    pub fn per_second(n: u32) -> Self {
        Self {
            per_second: n,
            burst: n,
        }
    }

    /// Override the burst size
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }
}

impl From<&RateLimitConfig> for RateQuota {
    fn from(config: &RateLimitConfig) -> Self {
        Self::per_second(config.max_rate_per_second).with_burst(config.max_burst)
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(quota: &RateQuota, now: Instant) -> Self {
        Self {
            tokens: f64::from(quota.burst),
            last_refill: now,
        }
    }

    fn try_acquire(&mut self, quota: &RateQuota, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * f64::from(quota.per_second)).min(f64::from(quota.burst));
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct Slot {
    bucket: Arc<Mutex<TokenBucket>>,
    last_used: u64,
}

#[derive(Default)]
struct KeyIndex {
    slots: HashMap<String, Slot>,
    clock: u64,
}

impl KeyIndex {
    fn bucket_for(
        &mut self,
        key: &str,
        max_keys: usize,
        quota: &RateQuota,
        now: Instant,
    ) -> Arc<Mutex<TokenBucket>> {
        self.clock += 1;
        let tick = self.clock;
        if let Some(slot) = self.slots.get_mut(key) {
            slot.last_used = tick;
            return Arc::clone(&slot.bucket);
        }

        while self.slots.len() >= max_keys {
            let oldest = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.slots.remove(&k);
                }
                None => break,
            }
        }

        let bucket = Arc::new(Mutex::new(TokenBucket::full(quota, now)));
        self.slots.insert(
            key.to_string(),
            Slot {
                bucket: Arc::clone(&bucket),
                last_used: tick,
            },
        );
        bucket
    }
}

/// Bounded per-key token-bucket limiter
pub struct RateLimiter {
    max_keys: usize,
    quota: RateQuota,
    index: Mutex<KeyIndex>,
}

impl RateLimiter {
    /// Create a limiter tracking at most `max_keys` keys
    pub fn new(max_keys: usize, quota: RateQuota) -> Result<Self> {
        if max_keys == 0 {
            return Err(Error::config("rate limiter needs room for at least one key"));
        }
        if quota.per_second == 0 || quota.burst == 0 {
            return Err(Error::config(
                "rate limiter rate and burst must be at least 1",
            ));
        }
        Ok(Self {
            max_keys,
            quota,
            index: Mutex::new(KeyIndex::default()),
        })
    }

    /// Build a limiter from operator configuration
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        Self::new(config.max_keys, RateQuota::from(config))
    }

    /// Take one token for `key`; `false` means the caller should skip this round
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let bucket = self
            .index
            .lock()
            .bucket_for(key, self.max_keys, &self.quota, now);
        let mut bucket = bucket.lock();
        bucket.try_acquire(&self.quota, now)
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.index.lock().slots.len()
    }

    /// Whether no key is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` currently has a bucket
    pub fn contains(&self, key: &str) -> bool {
        self.index.lock().slots.contains_key(key)
    }

}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_keys", &self.max_keys)
            .field("quota", &self.quota)
            .field("keys", &self.len())
            .finish()
    }
}

//! Token bucket admission control keyed by `tenant:command`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::trace;

const MS_PER_MINUTE: f64 = 60_000.0;

/// Limits for one `(tenant, command)` pair, usually taken from the command's
/// feature row.
///
/// A missing or non-positive value is treated as unset. If only one value
/// is set the other is inferred from it; if neither is set the command is
/// not throttled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleLimits {
    pub max_per_minute: Option<i64>,
    pub burst: Option<i64>,
}

impl ThrottleLimits {
    pub fn new(max_per_minute: Option<i64>, burst: Option<i64>) -> Self {
        Self {
            max_per_minute,
            burst,
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    /// `(capacity, refill tokens per ms)`, or `None` when unlimited.
    fn bucket_shape(&self) -> Option<(f64, f64)> {
        let rate = self.max_per_minute.filter(|v| *v > 0);
        let burst = self.burst.filter(|v| *v > 0);

        let (rate, burst) = match (rate, burst) {
            (None, None) => return None,
            (Some(rate), None) => (rate, rate),
            (None, Some(burst)) => (burst, burst),
            (Some(rate), Some(burst)) => (rate, burst),
        };

        Some((burst as f64, rate as f64 / MS_PER_MINUTE))
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_ms: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    fn refill(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_ms).min(self.capacity);
        self.last_refill_ms = now_ms.max(self.last_refill_ms);
    }
}

/// Token buckets per `tenant:command`, created lazily and never persisted.
pub struct ThrottleEngine {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    epoch: Instant,
}

impl ThrottleEngine {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    /// Whether one more `command` from `tenant` may be admitted now.
    pub fn allow(&self, tenant_id: &str, command_name: &str, limits: &ThrottleLimits) -> bool {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.allow_at(tenant_id, command_name, limits, now_ms)
    }

    /// Whether one more `command` from `tenant` may be admitted at `now_ms`.
    ///
    /// `now_ms` is any monotonic millisecond clock; only differences matter.
    /// The first call for a key always succeeds and leaves `capacity - 1`
    /// tokens.
    pub fn allow_at(
        &self,
        tenant_id: &str,
        command_name: &str,
        limits: &ThrottleLimits,
        now_ms: u64,
    ) -> bool {
        let Some((capacity, refill_per_ms)) = limits.bucket_shape() else {
            return true;
        };

        let key = format!("{tenant_id}:{command_name}");
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);

        let bucket = match buckets.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(TokenBucket {
                    tokens: capacity - 1.0,
                    capacity,
                    refill_per_ms,
                    last_refill_ms: now_ms,
                });
                return true;
            }
        };

        // Limits may have been edited since the bucket was created.
        bucket.capacity = capacity;
        bucket.refill_per_ms = refill_per_ms;
        bucket.refill(now_ms);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            trace!(tenant_id, command = command_name, tokens = bucket.tokens, "Token bucket empty");
            false
        }
    }

    /// Give back a token taken by [`allow`](Self::allow) for a command that
    /// was admitted but never recorded. Capped at the bucket's capacity.
    pub fn refund(&self, tenant_id: &str, command_name: &str, limits: &ThrottleLimits) {
        if limits.bucket_shape().is_none() {
            return;
        }

        let key = format!("{tenant_id}:{command_name}");
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bucket) = buckets.get_mut(&key) {
            bucket.tokens = (bucket.tokens + 1.0).min(bucket.capacity);
            trace!(tenant_id, command = command_name, tokens = bucket.tokens, "Token refunded");
        }
    }

    /// Number of buckets created so far.
    pub fn bucket_count(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for ThrottleEngine {
    fn default() -> Self {
        Self::new()
    }
}

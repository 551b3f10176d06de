//! Per-tenant publish spacing.
//!
//! Spreads consecutive publishes of one tenant at least `min_spacing_ms`
//! apart, plus up to `max_jitter_ms` of random delay, so a single busy tenant
//! does not hammer one partition in bursts. Reservations are recorded before
//! sleeping, so concurrent callers for the same tenant queue up behind each
//! other instead of waking together.

use dispatch_config_and_utils::{metrics, PublishThrottleSettings};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Key used for publishes without a tenant.
pub const SHARED_TENANT_KEY: &str = "__shared__";

/// Entries untouched for this long (at minimum) are purged.
const MIN_PURGE_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishThrottleConfig {
    pub min_spacing_ms: u64,
    pub max_jitter_ms: u64,
}

impl From<&PublishThrottleSettings> for PublishThrottleConfig {
    fn from(settings: &PublishThrottleSettings) -> Self {
        Self {
            min_spacing_ms: settings.min_spacing_ms,
            max_jitter_ms: settings.max_jitter_ms,
        }
    }
}

impl PublishThrottleConfig {
    fn is_disabled(&self) -> bool {
        self.min_spacing_ms == 0 && self.max_jitter_ms == 0
    }

    fn purge_interval_ms(&self) -> u64 {
        self.min_spacing_ms
            .saturating_mul(10)
            .max(MIN_PURGE_INTERVAL_MS)
    }
}

#[derive(Debug, Default)]
struct State {
    /// Tenant key -> reserved publish time (ms since `epoch`).
    last_published: HashMap<String, i64>,
    last_purge_ms: i64,
}

/// Per-tenant publish gate.
pub struct TenantPublishThrottler {
    config: PublishThrottleConfig,
    state: Mutex<State>,
    epoch: Instant,
}

impl TenantPublishThrottler {
    pub fn new(config: PublishThrottleConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            epoch: Instant::now(),
        }
    }

    pub fn config(&self) -> PublishThrottleConfig {
        self.config
    }

    /// Wait until `tenant_id` may publish again. Returns the time waited.
    ///
    /// A strict no-op when both spacing and jitter are zero.
    pub async fn wait(&self, tenant_id: &str) -> Duration {
        if self.config.is_disabled() {
            return Duration::ZERO;
        }

        let now_ms = self.epoch.elapsed().as_millis() as i64;
        let wait_ms = self.reserve_at(tenant_id, now_ms);

        if wait_ms > 0 {
            debug!(tenant_id = %tenant_id, wait_ms, "Spacing tenant publish");
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }
        metrics::record_publish_throttle_wait(wait_ms);

        Duration::from_millis(wait_ms)
    }

    /// Reserve the next publish slot for `tenant_id` at `now_ms` and return
    /// how long the caller must wait for it.
    ///
    /// `wait = max(0, spacing - (now - last)) + jitter`, and the reservation
    /// `now + wait` becomes the tenant's new `last`.
    pub fn reserve_at(&self, tenant_id: &str, now_ms: i64) -> u64 {
        if self.config.is_disabled() {
            return 0;
        }

        let key = if tenant_id.trim().is_empty() {
            SHARED_TENANT_KEY
        } else {
            tenant_id
        };

        let jitter = if self.config.max_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.max_jitter_ms)
        } else {
            0
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge_if_due(&mut state, now_ms);

        let spacing_wait = match state.last_published.get(key) {
            Some(last) => {
                let since_last = now_ms.saturating_sub(*last);
                (self.config.min_spacing_ms as i64)
                    .saturating_sub(since_last)
                    .max(0) as u64
            }
            None => 0,
        };

        let wait_ms = spacing_wait.saturating_add(jitter);
        state
            .last_published
            .insert(key.to_string(), now_ms.saturating_add(wait_ms as i64));

        wait_ms
    }

    /// Number of tenants currently tracked.
    pub fn tracked_tenants(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_published
            .len()
    }

    fn purge_if_due(&self, state: &mut State, now_ms: i64) {
        let interval = self.config.purge_interval_ms() as i64;
        if now_ms.saturating_sub(state.last_purge_ms) < interval {
            return;
        }

        let before = state.last_published.len();
        state
            .last_published
            .retain(|_, last| now_ms.saturating_sub(*last) <= interval);
        state.last_purge_ms = now_ms;

        let purged = before - state.last_published.len();
        if purged > 0 {
            debug!(purged, "Purged idle tenant publish entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttler(min_spacing_ms: u64, max_jitter_ms: u64) -> TenantPublishThrottler {
        TenantPublishThrottler::new(PublishThrottleConfig {
            min_spacing_ms,
            max_jitter_ms,
        })
    }

    #[test]
    fn zero_config_is_a_no_op() {
        let t = throttler(0, 0);
        assert_eq!(t.reserve_at("t1", 0), 0);
        assert_eq!(t.reserve_at("t1", 0), 0);
        assert_eq!(t.tracked_tenants(), 0);
    }

    #[test]
    fn spacing_applies_per_tenant() {
        let t = throttler(50, 0);
        assert_eq!(t.reserve_at("t1", 0), 0);
        assert_eq!(t.reserve_at("t1", 10), 40);
        // Other tenants are unaffected
        assert_eq!(t.reserve_at("t2", 10), 0);
    }

    #[test]
    fn back_to_back_reservations_queue_up() {
        let t = throttler(50, 0);
        assert_eq!(t.reserve_at("t1", 0), 0);
        // Reserved slot at 50; next one lands at 100
        assert_eq!(t.reserve_at("t1", 0), 50);
        assert_eq!(t.reserve_at("t1", 0), 100);
        assert_eq!(t.reserve_at("t1", 500), 0);
    }

    #[test]
    fn empty_tenant_uses_shared_key() {
        let t = throttler(50, 0);
        assert_eq!(t.reserve_at("", 0), 0);
        assert_eq!(t.reserve_at("  ", 20), 30);
        assert_eq!(t.tracked_tenants(), 1);
    }

    #[test]
    fn jitter_is_bounded() {
        let t = throttler(0, 20);
        for i in 0..100 {
            let wait = t.reserve_at(&format!("tenant-{i}"), 0);
            assert!(wait <= 20);
        }
    }

    #[test]
    fn idle_entries_are_purged() {
        let t = throttler(10, 0);
        t.reserve_at("t1", 0);
        t.reserve_at("t2", 0);
        assert_eq!(t.tracked_tenants(), 2);

        // Purge runs every max(10 * 10, 60s) = 60s
        t.reserve_at("t3", 30_000);
        assert_eq!(t.tracked_tenants(), 3);

        t.reserve_at("t3", 60_001);
        assert_eq!(t.tracked_tenants(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_for_spacing() {
        let t = throttler(50, 0);
        let started = Instant::now();

        assert_eq!(t.wait("t1").await, Duration::ZERO);
        let waited = t.wait("t1").await;

        assert_eq!(waited, Duration::from_millis(50));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_with_zero_config_never_suspends() {
        let t = throttler(0, 0);
        let started = Instant::now();
        for _ in 0..10 {
            assert_eq!(t.wait("t1").await, Duration::ZERO);
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}

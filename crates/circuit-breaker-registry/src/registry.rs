//! Registry of per-target circuit breakers.

use crate::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitTransition};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Capacity of the shared transition channel.
const TRANSITION_CHANNEL_CAPACITY: usize = 256;

/// Owns one [`CircuitBreaker`] per target name.
///
/// Breakers are created lazily on first lookup, at most once per target.
/// All breakers publish transitions on one shared channel.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: broadcast::Sender<CircuitTransition>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            default_config,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Use `config` instead of the default for one target.
    pub fn with_target_config(mut self, target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(target.into(), config);
        self
    }

    /// Get the breaker for `target`, creating it on first use.
    pub async fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(target) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(target)
                    .copied()
                    .unwrap_or(self.default_config);
                debug!(target_name = %target, "Created circuit breaker");
                Arc::new(CircuitBreaker::with_events(target, config, self.events.clone()))
            })
            .clone()
    }

    /// Subscribe to transitions of every breaker in the registry.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.events.subscribe()
    }

    /// Current state of every breaker created so far, sorted by target.
    pub async fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.read().await;
        let mut states: Vec<(String, CircuitState)> = breakers
            .iter()
            .map(|(target, breaker)| (target.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub async fn len(&self) -> usize {
        self.breakers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.breakers.read().await.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn get_returns_same_breaker() {
        let registry = CircuitBreakerRegistry::new(config(2));
        assert!(registry.is_empty().await);

        let a = registry.get("billing").await;
        let b = registry.get("billing").await;
        assert!(Arc::ptr_eq(&a, &b));

        registry.get("shipping").await;
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn concurrent_first_lookups_construct_once() {
        let registry = Arc::new(CircuitBreakerRegistry::new(config(2)));

        let mut handles = vec![];
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.get("billing").await }));
        }

        let mut breakers = vec![];
        for handle in handles {
            breakers.push(handle.await.unwrap());
        }

        assert_eq!(registry.len().await, 1);
        assert!(breakers.iter().all(|b| Arc::ptr_eq(b, &breakers[0])));
    }

    #[tokio::test]
    async fn per_target_override_and_shared_events() {
        let registry = CircuitBreakerRegistry::new(config(5)).with_target_config("fragile", config(1));
        let mut rx = registry.subscribe();

        let fragile = registry.get("fragile").await;
        let sturdy = registry.get("sturdy").await;

        fragile.record_failure();
        sturdy.record_failure();

        assert_eq!(fragile.state(), CircuitState::Open);
        assert_eq!(sturdy.state(), CircuitState::Closed);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.target, "fragile");
        assert_eq!(event.to, CircuitState::Open);
        assert!(rx.try_recv().is_err());

        assert_eq!(
            registry.snapshot().await,
            vec![
                ("fragile".to_string(), CircuitState::Open),
                ("sturdy".to_string(), CircuitState::Closed)
            ]
        );
    }
}

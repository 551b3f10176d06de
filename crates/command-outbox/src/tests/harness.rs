//! Test harness for outbox integration tests.
//!
//! Provides:
//! - TestHarness: a shared in-memory database and broker, plus helpers to
//!   enqueue rows and build extra dispatchers over the same table

use crate::{Broker, DispatcherConfig, InMemoryBroker, OutboxDispatcher, OutboxStore};
use command_throttle::{PublishThrottleConfig, TenantPublishThrottler};
use dispatch_database::{AsyncDatabase, NewOutboxEvent, OutboxEvent, OutboxStatus};
use retry_backoff_engine::RetryPolicy;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TOPIC: &str = "orders";

/// Dispatcher settings for tests: three attempts, no backoff delay.
pub fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        batch_size: 10,
        poll_interval: Duration::from_millis(10),
        claim_timeout_ms: 60_000,
        retry: RetryPolicy::exponential(3, 0),
        dead_letter_suffix: ".dead-letter".to_string(),
    }
}

pub struct TestHarness {
    pub db: AsyncDatabase,
    pub broker: Arc<InMemoryBroker>,
    pub dispatcher: OutboxDispatcher,
    config: DispatcherConfig,
    sequence: AtomicI64,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: DispatcherConfig) -> Self {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let broker = Arc::new(InMemoryBroker::new());
        let dispatcher = build_dispatcher(&db, &broker, "dispatcher-a", config.clone(), PublishThrottleConfig::default());

        Self {
            db,
            broker,
            dispatcher,
            config,
            sequence: AtomicI64::new(0),
        }
    }

    /// Harness whose dispatcher spaces publishes per tenant.
    pub async fn with_publish_spacing(min_spacing_ms: u64) -> Self {
        let mut harness = Self::new().await;
        harness.dispatcher = build_dispatcher(
            &harness.db,
            &harness.broker,
            "dispatcher-a",
            harness.config.clone(),
            PublishThrottleConfig {
                min_spacing_ms,
                max_jitter_ms: 0,
            },
        );
        harness
    }

    pub fn store(&self) -> &OutboxStore {
        self.dispatcher.store()
    }

    /// Another dispatcher over the same table and broker.
    pub fn second_dispatcher(&self, instance_id: &str) -> OutboxDispatcher {
        build_dispatcher(&self.db, &self.broker, instance_id, self.config.clone(), PublishThrottleConfig::default())
    }

    /// Another store identity over the same table.
    pub fn store_for(&self, instance_id: &str) -> OutboxStore {
        OutboxStore::with_instance_id(self.db.clone(), instance_id)
    }

    /// Insert a pending row. Rows become available in insertion order.
    pub async fn enqueue(&self, event_id: &str, tenant_id: &str, partition_key: &str) -> OutboxEvent {
        let available_at = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let headers = BTreeMap::from([
            ("commandName".to_string(), "order.create".to_string()),
            ("tenantId".to_string(), tenant_id.to_string()),
            ("requestId".to_string(), event_id.to_string()),
        ]);

        let event = NewOutboxEvent {
            event_id: event_id.to_string(),
            tenant_id: tenant_id.to_string(),
            aggregate_id: None,
            aggregate_type: "order".to_string(),
            event_type: "order.create".to_string(),
            payload: json!({"eventId": event_id, "amount": 42}),
            headers,
            target_topic: TOPIC.to_string(),
            target_service: Some("orders-service".to_string()),
            priority: 0,
            correlation_id: None,
            partition_key: partition_key.to_string(),
            idempotency_key: None,
            payload_hash: format!("hash-{event_id}"),
            available_at,
        };

        self.store().insert(event).await.unwrap().into_event()
    }

    pub async fn event(&self, event_id: &str) -> OutboxEvent {
        self.store().get(event_id).await.unwrap().unwrap()
    }

    pub async fn status(&self, event_id: &str) -> OutboxStatus {
        self.event(event_id).await.status
    }

    /// Poll until `event_id` reaches `status`, failing after two seconds.
    pub async fn wait_for_status(&self, event_id: &str, status: OutboxStatus) {
        let result = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if self.status(event_id).await == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "{event_id} never reached {status:?}");
    }

    /// Event ids of everything published to `topic`, in order.
    pub fn published_ids(&self, topic: &str) -> Vec<String> {
        self.broker
            .published_to(topic)
            .into_iter()
            .map(|m| m.headers["eventId"].clone())
            .collect()
    }
}

fn build_dispatcher(
    db: &AsyncDatabase,
    broker: &Arc<InMemoryBroker>,
    instance_id: &str,
    config: DispatcherConfig,
    throttle: PublishThrottleConfig,
) -> OutboxDispatcher {
    let broker: Arc<dyn Broker> = broker.clone();
    OutboxDispatcher::new(
        OutboxStore::with_instance_id(db.clone(), instance_id),
        broker,
        Arc::new(TenantPublishThrottler::new(throttle)),
        config,
    )
}

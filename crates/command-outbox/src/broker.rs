//! Message broker abstraction and implementations.
//!
//! - [`RedisStreamBroker`]: one Redis stream per topic (or per topic
//!   partition), written with `XADD`
//! - [`InMemoryBroker`]: records publishes in memory, with failure injection
//!   for tests and local runs

use crate::{BrokerError, BrokerResult};
use async_trait::async_trait;
use dispatch_config_and_utils::BrokerConfig;
use dispatch_database::OutboxEvent;
use redis::aio::MultiplexedConnection;
use redis::Client;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Header carrying the outbox event id. Consumers dedupe on it.
pub const EVENT_ID_HEADER: &str = "eventId";
/// Dead-letter header with the final delivery error.
pub const LAST_ERROR_HEADER: &str = "lastError";
/// Dead-letter header with the number of failed attempts.
pub const RETRY_COUNT_HEADER: &str = "retryCount";

/// One message as handed to the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerMessage {
    pub topic: String,
    /// Partition key. Messages sharing a key keep their relative order.
    pub key: String,
    pub payload: Value,
    pub headers: BTreeMap<String, String>,
}

impl BrokerMessage {
    /// Build the delivery envelope for an outbox row.
    pub fn from_event(event: &OutboxEvent) -> Self {
        let mut headers = event.headers.clone();
        headers.insert(EVENT_ID_HEADER.to_string(), event.event_id.clone());

        Self {
            topic: event.target_topic.clone(),
            key: event.partition_key.clone(),
            payload: event.payload.clone(),
            headers,
        }
    }

    /// Dead-letter copy of this envelope with the failure context attached.
    pub fn dead_letter(&self, suffix: &str, last_error: &str, retry_count: u32) -> Self {
        let mut headers = self.headers.clone();
        headers.insert(LAST_ERROR_HEADER.to_string(), last_error.to_string());
        headers.insert(RETRY_COUNT_HEADER.to_string(), retry_count.to_string());

        Self {
            topic: format!("{}{}", self.topic, suffix),
            key: self.key.clone(),
            payload: self.payload.clone(),
            headers,
        }
    }
}

/// Publishes messages to a partitioned broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish one message. Returns the broker-assigned message id.
    async fn publish(&self, message: &BrokerMessage) -> BrokerResult<String>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Stable partition index for `key` in `[0, partitions)`.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions)) as u32
}

// ============================================================================
// Redis Streams
// ============================================================================

/// Redis Streams broker.
///
/// A topic maps to the stream of the same name. With `partitions > 1` the
/// topic is sharded into `topic:{n}` streams and the partition key picks the
/// shard, so one key always lands on one stream.
pub struct RedisStreamBroker {
    conn: MultiplexedConnection,
    partitions: u32,
    max_stream_len: usize,
}

impl RedisStreamBroker {
    /// Connect to Redis.
    pub async fn connect(config: &BrokerConfig) -> BrokerResult<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;

        info!(
            partitions = config.partitions,
            max_stream_len = config.max_stream_len,
            "Connected to Redis broker"
        );

        Ok(Self {
            conn,
            partitions: config.partitions.max(1),
            max_stream_len: config.max_stream_len,
        })
    }

    /// Stream key a message is written to.
    pub fn stream_key(&self, message: &BrokerMessage) -> String {
        if self.partitions <= 1 {
            message.topic.clone()
        } else {
            format!("{}:{}", message.topic, partition_for(&message.key, self.partitions))
        }
    }
}

#[async_trait]
impl Broker for RedisStreamBroker {
    async fn publish(&self, message: &BrokerMessage) -> BrokerResult<String> {
        let stream_key = self.stream_key(message);
        let payload = serde_json::to_string(&message.payload)?;
        let headers = serde_json::to_string(&message.headers)?;

        // XADD key [MAXLEN ~ n] * field value [field value ...]
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&stream_key);
        if self.max_stream_len > 0 {
            cmd.arg("MAXLEN").arg("~").arg(self.max_stream_len);
        }
        cmd.arg("*")
            .arg("key")
            .arg(&message.key)
            .arg("payload")
            .arg(payload)
            .arg("headers")
            .arg(headers);

        let message_id: String = cmd.query_async(&mut self.conn.clone()).await?;

        debug!(
            stream = %stream_key,
            message_id = %message_id,
            key = %message.key,
            "Published to stream"
        );
        Ok(message_id)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// In-memory broker.
///
/// Keeps every successful publish in order. Failures can be injected for
/// the whole broker, for single topics, or for the next `n` publishes.
#[derive(Default)]
pub struct InMemoryBroker {
    published: Mutex<Vec<BrokerMessage>>,
    failing_topics: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    fail_next: AtomicUsize,
    attempts: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a full outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Reject every publish to `topic` until [`heal_topic`](Self::heal_topic).
    pub fn fail_topic(&self, topic: impl Into<String>) {
        self.failing_topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.into());
    }

    pub fn heal_topic(&self, topic: &str) {
        self.failing_topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
    }

    /// Fail the next `count` publishes regardless of topic.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Successful publishes, in order.
    pub fn published(&self) -> Vec<BrokerMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Successful publishes to `topic`, in order.
    pub fn published_to(&self, topic: &str) -> Vec<BrokerMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    /// Publish calls seen so far, including failed ones.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, message: &BrokerMessage) -> BrokerResult<String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("in-memory broker is down".to_string()));
        }
        if self.take_injected_failure() {
            return Err(BrokerError::Unavailable("injected failure".to_string()));
        }
        if self
            .failing_topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&message.topic)
        {
            return Err(BrokerError::Rejected(format!("topic {} is failing", message.topic)));
        }

        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        published.push(message.clone());
        debug!(topic = %message.topic, key = %message.key, "Recorded in-memory publish");
        Ok(format!("{}-{}", message.topic, attempt))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

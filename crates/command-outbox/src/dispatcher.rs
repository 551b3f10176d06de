//! Outbox dispatcher loop.
//!
//! Each pass:
//! 1. Claims a batch of deliverable rows (single atomic statement)
//! 2. For each row, in claim order: waits on the tenant publish throttler,
//!    then publishes `{key, payload, headers}` to the row's topic
//! 3. Marks the row delivered, schedules a retry with backoff, or marks it
//!    dead and copies it to the dead-letter topic
//!
//! Once a row is retried, loses its claim, or hits a store error, the rest of
//! its partition in the batch is released unattempted so later commands for
//! the same key never overtake it.
//!
//! Delivery failures never stop the loop. Store failures are logged and the
//! loop backs off for one poll interval.

use crate::{Broker, BrokerMessage, DispatchReport, OutboxResult, OutboxStore};
use command_throttle::TenantPublishThrottler;
use dispatch_config_and_utils::metrics::{self, labels};
use dispatch_config_and_utils::Config;
use dispatch_database::{now_ms, OutboxEvent};
use retry_backoff_engine::RetryPolicy;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum rows claimed per pass.
    pub batch_size: usize,
    /// Sleep after a pass that claimed nothing, and after store errors.
    pub poll_interval: Duration,
    /// Claims older than this are re-claimable.
    pub claim_timeout_ms: i64,
    /// Delivery attempts and backoff between them.
    pub retry: RetryPolicy,
    /// Appended to a topic to form its dead-letter topic.
    pub dead_letter_suffix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.dispatcher.batch_size,
            poll_interval: Duration::from_millis(config.dispatcher.poll_interval_ms),
            claim_timeout_ms: config.dispatcher.claim_timeout_ms.min(i64::MAX as u64) as i64,
            retry: RetryPolicy::from(&config.retry),
            dead_letter_suffix: config.broker.dead_letter_suffix.clone(),
        }
    }
}

/// What happened to one claimed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Delivered,
    Retried,
    Dead,
    /// The claim was taken over before the outcome could be recorded.
    LostClaim,
}

/// Background publisher for the outbox table.
///
/// Several dispatchers (in one process or many) may share a table; the
/// store's atomic claim keeps them from working the same row.
pub struct OutboxDispatcher {
    store: OutboxStore,
    broker: Arc<dyn Broker>,
    throttler: Arc<TenantPublishThrottler>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(
        store: OutboxStore,
        broker: Arc<dyn Broker>,
        throttler: Arc<TenantPublishThrottler>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            broker,
            throttler,
            config,
        }
    }

    pub fn store(&self) -> &OutboxStore {
        &self.store
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run until `shutdown` fires (or its sender is dropped).
    ///
    /// Shutdown is observed between rows. Rows claimed but not yet attempted
    /// are released back to the queue.
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) {
        info!(
            instance_id = %self.store.instance_id(),
            broker = self.broker.name(),
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting outbox dispatcher"
        );

        // A oneshot receiver must not be polled again once it has resolved.
        let mut shutdown_seen = false;
        loop {
            let (report, stopped) = match self.dispatch_pass(&mut shutdown, &mut shutdown_seen).await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Outbox dispatch pass failed");
                    metrics::record_dispatcher_error("claim");
                    (DispatchReport::default(), false)
                }
            };

            if stopped || shutdown_seen {
                break;
            }

            // A full batch means there is probably more work waiting.
            if report.claimed >= self.config.batch_size && self.config.batch_size > 0 {
                continue;
            }

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(instance_id = %self.store.instance_id(), "Outbox dispatcher stopped");
    }

    /// Claim and process one batch.
    pub async fn run_once(&self) -> OutboxResult<DispatchReport> {
        let events = self
            .store
            .claim_batch(self.config.batch_size, self.config.claim_timeout_ms)
            .await?;
        self.process_batch(events, || false).await.map(|(report, _)| report)
    }

    async fn dispatch_pass(
        &self,
        shutdown: &mut oneshot::Receiver<()>,
        shutdown_seen: &mut bool,
    ) -> OutboxResult<(DispatchReport, bool)> {
        let events = self
            .store
            .claim_batch(self.config.batch_size, self.config.claim_timeout_ms)
            .await?;

        self.process_batch(events, || {
            if !*shutdown_seen {
                *shutdown_seen = !matches!(shutdown.try_recv(), Err(oneshot::error::TryRecvError::Empty));
            }
            *shutdown_seen
        })
        .await
    }

    /// Process claimed rows in order. `should_stop` is checked before each
    /// row; once it returns true the remaining rows are released.
    pub(crate) async fn process_batch<S>(
        &self,
        events: Vec<OutboxEvent>,
        mut should_stop: S,
    ) -> OutboxResult<(DispatchReport, bool)>
    where
        S: FnMut() -> bool,
    {
        let mut report = DispatchReport {
            claimed: events.len(),
            ..DispatchReport::default()
        };
        if events.is_empty() {
            return Ok((report, should_stop()));
        }

        metrics::record_claim_batch(events.len());
        debug!(count = events.len(), "Dispatching claimed outbox rows");

        // Partitions whose earlier row did not leave the queue in this batch.
        let mut held: HashSet<String> = HashSet::new();
        let mut remaining = events.into_iter();
        while let Some(event) = remaining.next() {
            if should_stop() {
                let mut released = 0;
                for pending in std::iter::once(event).chain(remaining.by_ref()) {
                    if self.store.release(&pending.event_id).await? {
                        released += 1;
                    }
                }
                info!(released, "Released unprocessed claims on shutdown");
                report.released += released;
                return Ok((report, true));
            }

            if held.contains(&event.partition_key) {
                if self.store.release(&event.event_id).await? {
                    report.released += 1;
                }
                debug!(
                    event_id = %event.event_id,
                    partition_key = %event.partition_key,
                    "Released row behind an undelivered row of its partition"
                );
                continue;
            }

            match self.dispatch_one(&event).await {
                Ok(RowOutcome::Delivered) => report.delivered += 1,
                Ok(RowOutcome::Dead) => report.dead += 1,
                Ok(RowOutcome::Retried) => {
                    report.retried += 1;
                    held.insert(event.partition_key.clone());
                }
                Ok(RowOutcome::LostClaim) => {
                    report.lost_claims += 1;
                    held.insert(event.partition_key.clone());
                }
                Err(e) => {
                    // Row stays claimed and is recovered after the claim timeout.
                    error!(event_id = %event.event_id, error = %e, "Failed to record delivery outcome");
                    metrics::record_dispatcher_error("store");
                    held.insert(event.partition_key.clone());
                }
            }
        }

        Ok((report, false))
    }

    async fn dispatch_one(&self, event: &OutboxEvent) -> OutboxResult<RowOutcome> {
        self.throttler.wait(&event.tenant_id).await;

        let message = BrokerMessage::from_event(event);
        match self.broker.publish(&message).await {
            Ok(message_id) => {
                if !self.store.mark_delivered(&event.event_id).await? {
                    warn!(event_id = %event.event_id, "Delivered row was no longer claimed");
                    return Ok(RowOutcome::LostClaim);
                }
                debug!(
                    event_id = %event.event_id,
                    topic = %message.topic,
                    message_id = %message_id,
                    "Outbox event delivered"
                );
                metrics::record_dispatch(&message.topic, labels::DELIVERED);
                Ok(RowOutcome::Delivered)
            }
            Err(e) => self.handle_failure(event, &message, &e.to_string()).await,
        }
    }

    async fn handle_failure(
        &self,
        event: &OutboxEvent,
        message: &BrokerMessage,
        error_text: &str,
    ) -> OutboxResult<RowOutcome> {
        let attempt = event.retry_count;

        if attempt.saturating_add(1) < self.config.retry.max_retries {
            let next_available_at = self.config.retry.next_available_at(now_ms(), attempt);
            if !self
                .store
                .mark_retry(&event.event_id, next_available_at, error_text)
                .await?
            {
                warn!(event_id = %event.event_id, "Lost claim before scheduling retry");
                return Ok(RowOutcome::LostClaim);
            }

            warn!(
                event_id = %event.event_id,
                topic = %message.topic,
                attempt = attempt + 1,
                max_retries = self.config.retry.max_retries,
                next_available_at,
                error = %error_text,
                "Publish failed, retry scheduled"
            );
            metrics::record_dispatch(&message.topic, labels::RETRIED);
            return Ok(RowOutcome::Retried);
        }

        if !self.store.mark_dead(&event.event_id, error_text).await? {
            warn!(event_id = %event.event_id, "Lost claim before dead-lettering");
            return Ok(RowOutcome::LostClaim);
        }

        let retry_count = attempt.saturating_add(1);
        error!(
            event_id = %event.event_id,
            topic = %message.topic,
            retry_count,
            error = %error_text,
            "Publish retries exhausted, event is dead"
        );
        metrics::record_dispatch(&message.topic, labels::DEAD);

        let dead_letter = message.dead_letter(&self.config.dead_letter_suffix, error_text, retry_count);
        if let Err(e) = self.broker.publish(&dead_letter).await {
            // The dead row stays in the table and can be replayed.
            error!(
                event_id = %event.event_id,
                topic = %dead_letter.topic,
                error = %e,
                "Dead-letter publish failed"
            );
            metrics::record_dispatcher_error("dead_letter");
        }

        Ok(RowOutcome::Dead)
    }
}

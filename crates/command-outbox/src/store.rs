//! Durable outbox table access for one dispatcher instance.

use crate::OutboxResult;
use dispatch_database::{
    now_ms, queries, AsyncDatabase, InsertOutcome, NewOutboxEvent, OutboxEvent, OutboxStatus,
};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbox store bound to a dispatcher instance id.
///
/// Every claim made through this store is locked by `instance_id`; retry,
/// dead and release transitions only succeed while that lock is held.
/// Cloning is cheap and keeps the same identity.
#[derive(Clone)]
pub struct OutboxStore {
    db: AsyncDatabase,
    instance_id: String,
}

impl OutboxStore {
    /// Create a store with a fresh random instance id.
    pub fn new(db: AsyncDatabase) -> Self {
        Self::with_instance_id(db, format!("dispatcher-{}", Uuid::new_v4()))
    }

    pub fn with_instance_id(db: AsyncDatabase, instance_id: impl Into<String>) -> Self {
        Self {
            db,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn database(&self) -> &AsyncDatabase {
        &self.db
    }

    /// Write a new `pending` row, or return the existing row for a repeated
    /// idempotency key.
    pub async fn insert(&self, event: NewOutboxEvent) -> OutboxResult<InsertOutcome> {
        let now = now_ms();
        let outcome = self
            .db
            .call(move |conn| queries::insert_outbox_event(conn, &event, now))
            .await?;
        Ok(outcome)
    }

    pub async fn get(&self, event_id: &str) -> OutboxResult<Option<OutboxEvent>> {
        let event_id = event_id.to_string();
        let event = self
            .db
            .call(move |conn| queries::get_outbox_event(conn, &event_id))
            .await?;
        Ok(event)
    }

    pub async fn list(&self, status: Option<OutboxStatus>, limit: usize) -> OutboxResult<Vec<OutboxEvent>> {
        let events = self
            .db
            .call(move |conn| queries::list_outbox_events(conn, status, limit))
            .await?;
        Ok(events)
    }

    /// Claim up to `limit` deliverable rows now.
    pub async fn claim_batch(&self, limit: usize, claim_timeout_ms: i64) -> OutboxResult<Vec<OutboxEvent>> {
        self.claim_batch_at(limit, claim_timeout_ms, now_ms()).await
    }

    /// Claim up to `limit` rows deliverable at `now_ms`.
    pub async fn claim_batch_at(
        &self,
        limit: usize,
        claim_timeout_ms: i64,
        now_ms: i64,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let locked_by = self.instance_id.clone();
        let events = self
            .db
            .call(move |conn| {
                queries::claim_outbox_batch(conn, limit, claim_timeout_ms, &locked_by, now_ms)
            })
            .await?;
        Ok(events)
    }

    /// Returns false if the row was no longer claimed.
    pub async fn mark_delivered(&self, event_id: &str) -> OutboxResult<bool> {
        let event_id = event_id.to_string();
        let now = now_ms();
        let updated = self
            .db
            .call(move |conn| queries::mark_outbox_delivered(conn, &event_id, now))
            .await?;
        Ok(updated)
    }

    /// Returns false if this instance no longer holds the claim.
    pub async fn mark_retry(&self, event_id: &str, next_available_at: i64, error: &str) -> OutboxResult<bool> {
        let event_id = event_id.to_string();
        let error = error.to_string();
        let locked_by = self.instance_id.clone();
        let updated = self
            .db
            .call(move |conn| {
                queries::mark_outbox_retry(conn, &event_id, &locked_by, next_available_at, &error)
            })
            .await?;
        Ok(updated)
    }

    /// Returns false if this instance no longer holds the claim.
    pub async fn mark_dead(&self, event_id: &str, error: &str) -> OutboxResult<bool> {
        let event_id = event_id.to_string();
        let error = error.to_string();
        let locked_by = self.instance_id.clone();
        let updated = self
            .db
            .call(move |conn| queries::mark_outbox_dead(conn, &event_id, &locked_by, &error))
            .await?;
        Ok(updated)
    }

    /// Hand a claimed row back without attempting it.
    pub async fn release(&self, event_id: &str) -> OutboxResult<bool> {
        let event_id = event_id.to_string();
        let locked_by = self.instance_id.clone();
        let updated = self
            .db
            .call(move |conn| queries::release_outbox_claim(conn, &event_id, &locked_by))
            .await?;
        Ok(updated)
    }

    /// Move a dead row back to `pending` with a fresh retry budget.
    pub async fn requeue_dead(&self, event_id: &str) -> OutboxResult<bool> {
        let id = event_id.to_string();
        let now = now_ms();
        let requeued = self
            .db
            .call(move |conn| queries::requeue_dead_event(conn, &id, now))
            .await?;

        if requeued {
            info!(event_id = %event_id, "Requeued dead outbox event");
        } else {
            warn!(event_id = %event_id, "Outbox event is not dead, nothing to requeue");
        }
        Ok(requeued)
    }

    /// Delete delivered rows older than `older_than`.
    pub async fn purge_delivered(&self, older_than: Duration) -> OutboxResult<usize> {
        let age_ms = older_than.as_millis().min(i64::MAX as u128) as i64;
        let cutoff = now_ms().saturating_sub(age_ms);
        let purged = self
            .db
            .call(move |conn| queries::purge_delivered_events(conn, cutoff))
            .await?;
        debug!(purged, cutoff, "Purged delivered outbox events");
        Ok(purged)
    }

    /// Row counts per status.
    pub async fn counts(&self) -> OutboxResult<Vec<(OutboxStatus, u64)>> {
        let counts = self.db.call(queries::count_outbox_by_status).await?;
        Ok(counts)
    }
}

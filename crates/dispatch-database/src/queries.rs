//! Standalone query functions.
//!
//! Each function takes a `&Connection` as its first parameter and runs inside
//! [`crate::AsyncDatabase::call`]. Functions that compare against the clock take
//! `now_ms` so callers and tests control time.

use crate::{
    CommandFeature, CommandRoute, DatabaseError, DatabaseResult, FeatureStatus, InsertOutcome,
    NewCommandFeature, NewCommandRoute, NewOutboxEvent, OutboxEvent, OutboxStatus, RouteStatus,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::cmp::Ordering;
use tracing::debug;
use uuid::Uuid;

macro_rules! outbox_columns {
    () => {
        "event_id, tenant_id, aggregate_id, aggregate_type, event_type, payload, headers,
         target_topic, target_service, status, available_at, locked_at, locked_by, retry_count,
         priority, correlation_id, partition_key, idempotency_key, payload_hash, last_error,
         created_at, delivered_at"
    };
}

macro_rules! route_columns {
    () => {
        "id, command_name, environment, tenant_id, target_service, target_topic, weight, status, updated_at"
    };
}

macro_rules! feature_columns {
    () => {
        "id, command_name, environment, tenant_id, status, max_per_minute, burst, updated_at"
    };
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn map_outbox_row(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
    Ok(OutboxEvent {
        event_id: row.get(0)?,
        tenant_id: row.get(1)?,
        aggregate_id: row.get(2)?,
        aggregate_type: row.get(3)?,
        event_type: row.get(4)?,
        payload: json_column(row, 5)?,
        headers: json_column(row, 6)?,
        target_topic: row.get(7)?,
        target_service: row.get(8)?,
        status: OutboxStatus::from_str(&row.get::<_, String>(9)?),
        available_at: row.get(10)?,
        locked_at: row.get(11)?,
        locked_by: row.get(12)?,
        retry_count: row.get(13)?,
        priority: row.get(14)?,
        correlation_id: row.get(15)?,
        partition_key: row.get(16)?,
        idempotency_key: row.get(17)?,
        payload_hash: row.get(18)?,
        last_error: row.get(19)?,
        created_at: row.get(20)?,
        delivered_at: row.get(21)?,
    })
}

fn map_route_row(row: &Row<'_>) -> rusqlite::Result<CommandRoute> {
    Ok(CommandRoute {
        id: row.get(0)?,
        command_name: row.get(1)?,
        environment: row.get(2)?,
        tenant_id: row.get(3)?,
        target_service: row.get(4)?,
        target_topic: row.get(5)?,
        weight: row.get(6)?,
        status: RouteStatus::from_str(&row.get::<_, String>(7)?),
        updated_at: row.get(8)?,
    })
}

fn map_feature_row(row: &Row<'_>) -> rusqlite::Result<CommandFeature> {
    Ok(CommandFeature {
        id: row.get(0)?,
        command_name: row.get(1)?,
        environment: row.get(2)?,
        tenant_id: row.get(3)?,
        status: FeatureStatus::from_str(&row.get::<_, String>(4)?),
        max_per_minute: row.get(5)?,
        burst: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn optional<T>(result: rusqlite::Result<T>) -> DatabaseResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Claim order: priority, then availability, then age.
fn claim_order(a: &OutboxEvent, b: &OutboxEvent) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.available_at.cmp(&b.available_at))
        .then(a.created_at.cmp(&b.created_at))
        .then_with(|| a.event_id.cmp(&b.event_id))
}

// ==========================================
// Outbox
// ==========================================

/// Insert a new outbox row.
///
/// When the row carries an idempotency key that already exists for the
/// tenant, nothing is written and the existing row is returned.
pub fn insert_outbox_event(
    conn: &Connection,
    event: &NewOutboxEvent,
    now_ms: i64,
) -> DatabaseResult<InsertOutcome> {
    let payload = serde_json::to_string(&event.payload)?;
    let headers = serde_json::to_string(&event.headers)?;

    let inserted = conn.execute(
        "INSERT INTO outbox_events (event_id, tenant_id, aggregate_id, aggregate_type, event_type,
            payload, headers, target_topic, target_service, status, available_at, retry_count,
            priority, correlation_id, partition_key, idempotency_key, payload_hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10, 0, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT DO NOTHING",
        params![
            event.event_id,
            event.tenant_id,
            event.aggregate_id,
            event.aggregate_type,
            event.event_type,
            payload,
            headers,
            event.target_topic,
            event.target_service,
            event.available_at,
            event.priority,
            event.correlation_id,
            event.partition_key,
            event.idempotency_key,
            event.payload_hash,
            now_ms,
        ],
    )?;

    if inserted == 1 {
        let stored = get_outbox_event(conn, &event.event_id)?.ok_or_else(|| {
            DatabaseError::NotFound(format!("outbox event {} after insert", event.event_id))
        })?;
        return Ok(InsertOutcome::Inserted(stored));
    }

    if let Some(key) = event.idempotency_key.as_deref() {
        if let Some(existing) = get_outbox_event_by_idempotency_key(conn, &event.tenant_id, key)? {
            debug!(
                tenant_id = %event.tenant_id,
                event_id = %existing.event_id,
                "Idempotency key already recorded"
            );
            return Ok(InsertOutcome::Duplicate(existing));
        }
    }

    Err(DatabaseError::DuplicateEventId(event.event_id.clone()))
}

/// Get an outbox row by event id.
pub fn get_outbox_event(conn: &Connection, event_id: &str) -> DatabaseResult<Option<OutboxEvent>> {
    let mut stmt = conn.prepare_cached(concat!(
        "SELECT ",
        outbox_columns!(),
        " FROM outbox_events WHERE event_id = ?1"
    ))?;
    optional(stmt.query_row(params![event_id], map_outbox_row))
}

/// Get an outbox row by its tenant-scoped idempotency key.
pub fn get_outbox_event_by_idempotency_key(
    conn: &Connection,
    tenant_id: &str,
    idempotency_key: &str,
) -> DatabaseResult<Option<OutboxEvent>> {
    let mut stmt = conn.prepare_cached(concat!(
        "SELECT ",
        outbox_columns!(),
        " FROM outbox_events WHERE tenant_id = ?1 AND idempotency_key = ?2"
    ))?;
    optional(stmt.query_row(params![tenant_id, idempotency_key], map_outbox_row))
}

/// List outbox rows, newest first, optionally filtered by status.
pub fn list_outbox_events(
    conn: &Connection,
    status: Option<OutboxStatus>,
    limit: usize,
) -> DatabaseResult<Vec<OutboxEvent>> {
    let mut stmt = conn.prepare_cached(concat!(
        "SELECT ",
        outbox_columns!(),
        " FROM outbox_events
          WHERE (?1 IS NULL OR status = ?1)
          ORDER BY created_at DESC, event_id ASC
          LIMIT ?2"
    ))?;

    let events = stmt
        .query_map(
            params![status.map(|s| s.as_str()), limit as i64],
            map_outbox_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

/// Atomically claim up to `limit` deliverable rows for `locked_by`.
///
/// Deliverable rows are `pending`/`retrying` rows whose `available_at` has
/// passed, and `claimed` rows whose lock is at least `claim_timeout_ms` old.
/// A row is skipped while another row with the same partition key holds a
/// live claim, so one partition is worked by one dispatcher at a time. A row
/// is also skipped while an earlier row of its partition is retrying or not
/// yet due, so a failed head of line holds back the rows queued behind it.
///
/// The selection and the update are one statement. Returned rows are in
/// claim order.
pub fn claim_outbox_batch(
    conn: &Connection,
    limit: usize,
    claim_timeout_ms: i64,
    locked_by: &str,
    now_ms: i64,
) -> DatabaseResult<Vec<OutboxEvent>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let stale_before = now_ms.saturating_sub(claim_timeout_ms);

    let mut stmt = conn.prepare_cached(concat!(
        "UPDATE outbox_events
         SET status = 'claimed', locked_at = ?1, locked_by = ?2
         WHERE event_id IN (
             SELECT o.event_id FROM outbox_events o
             WHERE ((o.status IN ('pending', 'retrying') AND o.available_at <= ?1)
                    OR (o.status = 'claimed' AND o.locked_at <= ?3))
               AND NOT EXISTS (
                   SELECT 1 FROM outbox_events c
                   WHERE c.partition_key = o.partition_key
                     AND c.event_id <> o.event_id
                     AND c.status = 'claimed'
                     AND c.locked_at > ?3
               )
               AND NOT EXISTS (
                   SELECT 1 FROM outbox_events h
                   WHERE h.partition_key = o.partition_key
                     AND h.rowid < o.rowid
                     AND (h.status = 'retrying'
                          OR (h.status = 'pending' AND h.available_at > ?1))
               )
             ORDER BY o.priority ASC, o.available_at ASC, o.created_at ASC
             LIMIT ?4
         )
         RETURNING ",
        outbox_columns!()
    ))?;

    let mut events = stmt
        .query_map(
            params![now_ms, locked_by, stale_before, limit as i64],
            map_outbox_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    events.sort_by(claim_order);

    if !events.is_empty() {
        debug!(count = events.len(), locked_by, "Claimed outbox rows");
    }
    Ok(events)
}

/// Mark a claimed row delivered. Returns false if the row was not claimed.
pub fn mark_outbox_delivered(conn: &Connection, event_id: &str, now_ms: i64) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_events
         SET status = 'delivered', delivered_at = ?1, locked_at = NULL, locked_by = NULL,
             last_error = NULL
         WHERE event_id = ?2 AND status = 'claimed'",
        params![now_ms, event_id],
    )?;
    Ok(count == 1)
}

/// Release a claimed row for a later attempt.
///
/// Only the current lock holder may do this. Increments `retry_count`.
pub fn mark_outbox_retry(
    conn: &Connection,
    event_id: &str,
    locked_by: &str,
    next_available_at: i64,
    error: &str,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_events
         SET status = 'retrying', retry_count = retry_count + 1, available_at = ?1,
             last_error = ?2, locked_at = NULL, locked_by = NULL
         WHERE event_id = ?3 AND status = 'claimed' AND locked_by = ?4",
        params![next_available_at, error, event_id, locked_by],
    )?;
    Ok(count == 1)
}

/// Move a claimed row to `dead`. Only the current lock holder may do this.
pub fn mark_outbox_dead(
    conn: &Connection,
    event_id: &str,
    locked_by: &str,
    error: &str,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_events
         SET status = 'dead', retry_count = retry_count + 1, last_error = ?1,
             locked_at = NULL, locked_by = NULL
         WHERE event_id = ?2 AND status = 'claimed' AND locked_by = ?3",
        params![error, event_id, locked_by],
    )?;
    Ok(count == 1)
}

/// Give up a claim without attempting delivery.
///
/// The row goes back to `pending` (or `retrying` if it has failed before)
/// and becomes claimable immediately. `retry_count` is unchanged.
pub fn release_outbox_claim(conn: &Connection, event_id: &str, locked_by: &str) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_events
         SET status = CASE WHEN retry_count = 0 THEN 'pending' ELSE 'retrying' END,
             locked_at = NULL, locked_by = NULL
         WHERE event_id = ?1 AND status = 'claimed' AND locked_by = ?2",
        params![event_id, locked_by],
    )?;
    Ok(count == 1)
}

/// Put a dead row back to `pending` with a fresh retry budget.
pub fn requeue_dead_event(conn: &Connection, event_id: &str, now_ms: i64) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_events
         SET status = 'pending', retry_count = 0, available_at = ?1, last_error = NULL
         WHERE event_id = ?2 AND status = 'dead'",
        params![now_ms, event_id],
    )?;
    Ok(count == 1)
}

/// Delete delivered rows whose `delivered_at` is at or before the cutoff.
pub fn purge_delivered_events(conn: &Connection, delivered_before_ms: i64) -> DatabaseResult<usize> {
    let count = conn.execute(
        "DELETE FROM outbox_events WHERE status = 'delivered' AND delivered_at <= ?1",
        params![delivered_before_ms],
    )?;
    Ok(count)
}

/// Row counts for every status, including zeros.
pub fn count_outbox_by_status(conn: &Connection) -> DatabaseResult<Vec<(OutboxStatus, u64)>> {
    let mut stmt = conn.prepare_cached("SELECT status, COUNT(*) FROM outbox_events GROUP BY status")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((OutboxStatus::from_str(&row.get::<_, String>(0)?), row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(OutboxStatus::ALL
        .iter()
        .map(|status| {
            let count = rows
                .iter()
                .filter(|(s, _)| s == status)
                .map(|(_, c)| *c as u64)
                .sum();
            (*status, count)
        })
        .collect())
}

// ==========================================
// Command Routes
// ==========================================

/// Insert or update a route. Identity is `(command, environment, tenant, topic)`.
pub fn upsert_command_route(
    conn: &Connection,
    route: &NewCommandRoute,
    now_ms: i64,
) -> DatabaseResult<CommandRoute> {
    let updated = conn.execute(
        "UPDATE command_routes
         SET target_service = ?1, weight = ?2, status = ?3, updated_at = ?4
         WHERE command_name = ?5 AND environment = ?6 AND tenant_id IS ?7 AND target_topic = ?8",
        params![
            route.target_service,
            route.weight,
            route.status.as_str(),
            now_ms,
            route.command_name,
            route.environment,
            route.tenant_id,
            route.target_topic,
        ],
    )?;

    if updated == 0 {
        conn.execute(
            "INSERT INTO command_routes (id, command_name, environment, tenant_id, target_service,
                target_topic, weight, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Uuid::new_v4().to_string(),
                route.command_name,
                route.environment,
                route.tenant_id,
                route.target_service,
                route.target_topic,
                route.weight,
                route.status.as_str(),
                now_ms,
            ],
        )?;
    }

    let mut stmt = conn.prepare_cached(concat!(
        "SELECT ",
        route_columns!(),
        " FROM command_routes
          WHERE command_name = ?1 AND environment = ?2 AND tenant_id IS ?3 AND target_topic = ?4"
    ))?;
    optional(stmt.query_row(
        params![
            route.command_name,
            route.environment,
            route.tenant_id,
            route.target_topic
        ],
        map_route_row,
    ))?
    .ok_or_else(|| DatabaseError::NotFound("Command route not found after upsert".to_string()))
}

fn active_routes_in_scope(
    conn: &Connection,
    command_name: &str,
    environment: &str,
    tenant_id: Option<&str>,
) -> DatabaseResult<Vec<CommandRoute>> {
    let mut stmt = conn.prepare_cached(concat!(
        "SELECT ",
        route_columns!(),
        " FROM command_routes
          WHERE command_name = ?1 AND environment = ?2 AND tenant_id IS ?3 AND status = 'active'
          ORDER BY target_topic ASC"
    ))?;

    let routes = stmt
        .query_map(params![command_name, environment, tenant_id], map_route_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(routes)
}

/// Active route candidates for a command.
///
/// If the tenant has any active row of its own, only tenant rows are
/// returned; otherwise the global rows are.
pub fn resolve_command_routes(
    conn: &Connection,
    command_name: &str,
    environment: &str,
    tenant_id: &str,
) -> DatabaseResult<Vec<CommandRoute>> {
    let tenant_routes = active_routes_in_scope(conn, command_name, environment, Some(tenant_id))?;
    if !tenant_routes.is_empty() {
        return Ok(tenant_routes);
    }
    active_routes_in_scope(conn, command_name, environment, None)
}

/// List routes, optionally filtered by command name.
pub fn list_command_routes(
    conn: &Connection,
    command_name: Option<&str>,
) -> DatabaseResult<Vec<CommandRoute>> {
    let mut stmt = conn.prepare_cached(concat!(
        "SELECT ",
        route_columns!(),
        " FROM command_routes
          WHERE (?1 IS NULL OR command_name = ?1)
          ORDER BY command_name, environment, tenant_id, target_topic"
    ))?;

    let routes = stmt
        .query_map(params![command_name], map_route_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(routes)
}

// ==========================================
// Command Features
// ==========================================

/// Insert or update a feature row. Identity is `(command, environment, tenant)`.
pub fn upsert_command_feature(
    conn: &Connection,
    feature: &NewCommandFeature,
    now_ms: i64,
) -> DatabaseResult<CommandFeature> {
    let updated = conn.execute(
        "UPDATE command_features
         SET status = ?1, max_per_minute = ?2, burst = ?3, updated_at = ?4
         WHERE command_name = ?5 AND environment = ?6 AND tenant_id IS ?7",
        params![
            feature.status.as_str(),
            feature.max_per_minute,
            feature.burst,
            now_ms,
            feature.command_name,
            feature.environment,
            feature.tenant_id,
        ],
    )?;

    if updated == 0 {
        conn.execute(
            "INSERT INTO command_features (id, command_name, environment, tenant_id, status,
                max_per_minute, burst, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Uuid::new_v4().to_string(),
                feature.command_name,
                feature.environment,
                feature.tenant_id,
                feature.status.as_str(),
                feature.max_per_minute,
                feature.burst,
                now_ms,
            ],
        )?;
    }

    feature_in_scope(
        conn,
        &feature.command_name,
        &feature.environment,
        feature.tenant_id.as_deref(),
    )?
    .ok_or_else(|| DatabaseError::NotFound("Command feature not found after upsert".to_string()))
}

fn feature_in_scope(
    conn: &Connection,
    command_name: &str,
    environment: &str,
    tenant_id: Option<&str>,
) -> DatabaseResult<Option<CommandFeature>> {
    let mut stmt = conn.prepare_cached(concat!(
        "SELECT ",
        feature_columns!(),
        " FROM command_features
          WHERE command_name = ?1 AND environment = ?2 AND tenant_id IS ?3"
    ))?;
    optional(stmt.query_row(params![command_name, environment, tenant_id], map_feature_row))
}

/// Feature row for a command: the tenant's own row, else the global row.
pub fn resolve_command_feature(
    conn: &Connection,
    command_name: &str,
    environment: &str,
    tenant_id: &str,
) -> DatabaseResult<Option<CommandFeature>> {
    if let Some(feature) = feature_in_scope(conn, command_name, environment, Some(tenant_id))? {
        return Ok(Some(feature));
    }
    feature_in_scope(conn, command_name, environment, None)
}

/// List feature rows, optionally filtered by command name.
pub fn list_command_features(
    conn: &Connection,
    command_name: Option<&str>,
) -> DatabaseResult<Vec<CommandFeature>> {
    let mut stmt = conn.prepare_cached(concat!(
        "SELECT ",
        feature_columns!(),
        " FROM command_features
          WHERE (?1 IS NULL OR command_name = ?1)
          ORDER BY command_name, environment, tenant_id"
    ))?;

    let features = stmt
        .query_map(params![command_name], map_feature_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(features)
}

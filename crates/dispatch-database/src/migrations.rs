//! Database migrations.
//!
//! Migrations run in order and are tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Schema up to date");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_events(conn)?;
    }
    if current_version < 2 {
        migrate_v2_command_routes(conn)?;
    }
    if current_version < 3 {
        migrate_v3_command_features(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: the outbox table.
fn migrate_v1_outbox_events(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: outbox events");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_events (
            event_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            aggregate_id TEXT,
            aggregate_type TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            headers TEXT NOT NULL DEFAULT '{}',
            target_topic TEXT NOT NULL,
            target_service TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            available_at INTEGER NOT NULL,
            locked_at INTEGER,
            locked_by TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 0,
            correlation_id TEXT,
            partition_key TEXT NOT NULL,
            idempotency_key TEXT,
            payload_hash TEXT NOT NULL,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            delivered_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_events_claim
            ON outbox_events(status, priority, available_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_events_partition
            ON outbox_events(partition_key, status);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_outbox_events_idempotency
            ON outbox_events(tenant_id, idempotency_key)
            WHERE idempotency_key IS NOT NULL;
        ",
    )?;

    record_migration(conn, 1, "outbox_events")?;
    Ok(())
}

/// V2: command routing table. `tenant_id IS NULL` marks the global row.
fn migrate_v2_command_routes(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: command routes");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS command_routes (
            id TEXT PRIMARY KEY,
            command_name TEXT NOT NULL,
            environment TEXT NOT NULL,
            tenant_id TEXT,
            target_service TEXT NOT NULL,
            target_topic TEXT NOT NULL,
            weight INTEGER NOT NULL DEFAULT 100,
            status TEXT NOT NULL DEFAULT 'active',
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_command_routes_lookup
            ON command_routes(command_name, environment, tenant_id);
        ",
    )?;

    record_migration(conn, 2, "command_routes")?;
    Ok(())
}

/// V3: per-command feature flags and throttle limits.
fn migrate_v3_command_features(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v3: command features");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS command_features (
            id TEXT PRIMARY KEY,
            command_name TEXT NOT NULL,
            environment TEXT NOT NULL,
            tenant_id TEXT,
            status TEXT NOT NULL DEFAULT 'enabled',
            max_per_minute INTEGER,
            burst INTEGER,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_command_features_lookup
            ON command_features(command_name, environment, tenant_id);
        ",
    )?;

    record_migration(conn, 3, "command_features")?;
    Ok(())
}

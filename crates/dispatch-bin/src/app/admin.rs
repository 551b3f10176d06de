//! Operator commands: routes, features, status, replay and purge.

use crate::app::AppContext;
use crate::{FeatureSetArgs, RouteSetArgs};
use dispatch_database::{
    now_ms, queries, CommandFeature, CommandRoute, NewCommandFeature, NewCommandRoute, OutboxStatus,
    RouteStatus,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

/// Outbox row counts per status.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub environment: String,
    pub database: String,
    pub counts: BTreeMap<&'static str, u64>,
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_status(report: &StatusReport) {
    println!("Environment: {}", report.environment);
    println!("Database:    {}", report.database);
    for (status, count) in &report.counts {
        println!("  {:<10} {}", status, count);
    }
}

/// Create or update a route in the configured environment.
pub async fn set_route(ctx: &AppContext, args: RouteSetArgs) -> anyhow::Result<CommandRoute> {
    let route = NewCommandRoute {
        command_name: args.command,
        environment: ctx.config.environment.clone(),
        tenant_id: args.tenant,
        target_service: args.service,
        target_topic: args.topic,
        weight: args.weight,
        status: if args.disabled {
            RouteStatus::Disabled
        } else {
            RouteStatus::Active
        },
    };

    let saved = ctx
        .db
        .call(move |conn| queries::upsert_command_route(conn, &route, now_ms()))
        .await?;
    info!(
        command = %saved.command_name,
        topic = %saved.target_topic,
        status = saved.status.as_str(),
        "Route saved"
    );
    Ok(saved)
}

pub async fn list_routes(ctx: &AppContext, command: Option<String>) -> anyhow::Result<Vec<CommandRoute>> {
    Ok(ctx
        .db
        .call(move |conn| queries::list_command_routes(conn, command.as_deref()))
        .await?)
}

/// Create or update a feature row in the configured environment.
pub async fn set_feature(ctx: &AppContext, args: FeatureSetArgs) -> anyhow::Result<CommandFeature> {
    let feature = NewCommandFeature {
        command_name: args.command,
        environment: ctx.config.environment.clone(),
        tenant_id: args.tenant,
        status: args.status.into(),
        max_per_minute: args.max_per_minute,
        burst: args.burst,
    };

    let saved = ctx
        .db
        .call(move |conn| queries::upsert_command_feature(conn, &feature, now_ms()))
        .await?;
    info!(
        command = %saved.command_name,
        status = saved.status.as_str(),
        "Feature saved"
    );
    Ok(saved)
}

pub async fn list_features(
    ctx: &AppContext,
    command: Option<String>,
) -> anyhow::Result<Vec<CommandFeature>> {
    Ok(ctx
        .db
        .call(move |conn| queries::list_command_features(conn, command.as_deref()))
        .await?)
}

pub async fn status(ctx: &AppContext) -> anyhow::Result<StatusReport> {
    let mut counts: BTreeMap<&'static str, u64> =
        OutboxStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
    for (status, count) in ctx.store().counts().await? {
        counts.insert(status.as_str(), count);
    }

    Ok(StatusReport {
        environment: ctx.config.environment.clone(),
        database: ctx.db.path().to_string(),
        counts,
    })
}

/// Requeue a dead event. Returns false when the event is missing or not dead.
pub async fn replay(ctx: &AppContext, event_id: &str) -> anyhow::Result<bool> {
    Ok(ctx.store().requeue_dead(event_id).await?)
}

pub async fn purge_delivered(ctx: &AppContext, older_than_secs: u64) -> anyhow::Result<usize> {
    Ok(ctx
        .store()
        .purge_delivered(Duration::from_secs(older_than_secs))
        .await?)
}

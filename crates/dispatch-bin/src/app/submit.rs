//! `submit`: run a command through admission from the shell.

use crate::app::AppContext;
use crate::SubmitArgs;
use anyhow::Context;
use circuit_breaker_registry::{CircuitBreakerConfig, CircuitBreakerRegistry};
use command_intake::{
    Accepted, CommandIntake, ForwardResponse, HttpForwardTransport, IntakeConfig, SubmitCommand,
    ValidatorRegistry,
};
use command_throttle::ThrottleEngine;
use serde_json::Value;
use std::sync::Arc;

/// Queue a command in the outbox.
pub async fn submit(ctx: &AppContext, args: SubmitArgs) -> anyhow::Result<Accepted> {
    let command = build_command(args)?;
    let intake = build_intake(ctx);
    Ok(intake.submit(command).await?)
}

/// Execute a command synchronously on its target service.
pub async fn execute_now(ctx: &AppContext, args: SubmitArgs) -> anyhow::Result<ForwardResponse> {
    let command = build_command(args)?;
    let transport = HttpForwardTransport::from_config(&ctx.config)?;
    let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig::from(&ctx.config.circuit_breaker));
    let intake = build_intake(ctx).with_forwarder(Arc::new(transport), Arc::new(breakers));
    Ok(intake.execute_now(command).await?)
}

// No payload validators are registered for CLI submissions. The throttle
// engine lives only as long as this process, so rate limits never bite here.
fn build_intake(ctx: &AppContext) -> CommandIntake {
    CommandIntake::new(
        ctx.store(),
        ValidatorRegistry::new(),
        Arc::new(ThrottleEngine::new()),
        IntakeConfig::from_config(&ctx.config),
    )
}

fn build_command(args: SubmitArgs) -> anyhow::Result<SubmitCommand> {
    let payload: Value =
        serde_json::from_str(&args.payload).context("--payload must be valid JSON")?;

    let mut command = SubmitCommand::new(args.command, args.tenant, payload).with_priority(args.priority);
    command.aggregate_type = args.aggregate_type;
    command.aggregate_id = args.aggregate_id;
    command.correlation_id = args.correlation_id;
    command.initiated_by = args.initiated_by;
    command.idempotency_key = args.idempotency_key;
    Ok(command)
}

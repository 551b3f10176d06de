//! Command admission and outbox write.
//!
//! `submit` runs the admission pipeline and writes one outbox row:
//! 1. Payload validation by command name
//! 2. Idempotency lookup (a repeated key returns the original dispatch)
//! 3. Route resolution (tenant rows override global rows, weighted choice)
//! 4. Feature gate (`disabled` rejects)
//! 5. Token bucket (`enabled` rejects when empty, `observation` only logs)
//! 6. Outbox insert
//!
//! The broker is never touched here; delivery is the dispatcher's job.
//! `execute_now` runs steps 1 and 3-5 and then forwards the command to its
//! target service behind that service's circuit breaker.

use crate::forward::{ForwardRequest, ForwardResponse, ForwardTransport};
use crate::routing::choose_route;
use crate::{AdmissionRejection, IntakeError, IntakeResult, RejectionCode, ValidatorRegistry};
use circuit_breaker_registry::{CircuitBreakerError, CircuitBreakerRegistry};
use command_outbox::OutboxStore;
use command_throttle::{ThrottleEngine, ThrottleLimits};
use dispatch_config_and_utils::metrics::{self, labels};
use dispatch_config_and_utils::Config;
use dispatch_database::{
    now_ms, queries, CommandFeature, CommandRoute, FeatureStatus, NewOutboxEvent,
};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const COMMAND_NAME_HEADER: &str = "commandName";
pub const TENANT_ID_HEADER: &str = "tenantId";
pub const REQUEST_ID_HEADER: &str = "requestId";
pub const CORRELATION_ID_HEADER: &str = "correlationId";
pub const INITIATED_BY_HEADER: &str = "initiatedBy";
pub const PAYLOAD_HASH_HEADER: &str = "payloadHash";

/// Intake policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeConfig {
    /// Environment matched against route and feature rows.
    pub environment: String,
    /// Reject commands without a registered validator.
    pub strict_unknown_commands: bool,
}

impl IntakeConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            environment: config.environment.clone(),
            strict_unknown_commands: config.intake.strict_unknown_commands,
        }
    }
}

/// A command as received from the API.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitCommand {
    pub command_name: String,
    pub tenant_id: String,
    pub payload: Value,
    /// Defaults to the command name's first segment (`order.create` -> `order`).
    pub aggregate_type: Option<String>,
    /// Used as the partition key when present, otherwise the tenant is.
    pub aggregate_id: Option<String>,
    pub correlation_id: Option<String>,
    pub initiated_by: Option<String>,
    pub idempotency_key: Option<String>,
    /// Lower is dispatched first.
    pub priority: i64,
}

impl SubmitCommand {
    pub fn new(command_name: impl Into<String>, tenant_id: impl Into<String>, payload: Value) -> Self {
        Self {
            command_name: command_name.into(),
            tenant_id: tenant_id.into(),
            payload,
            aggregate_type: None,
            aggregate_id: None,
            correlation_id: None,
            initiated_by: None,
            idempotency_key: None,
            priority: 0,
        }
    }

    pub fn with_aggregate(mut self, aggregate_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_initiated_by(mut self, initiated_by: impl Into<String>) -> Self {
        self.initiated_by = Some(initiated_by.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    fn partition_key(&self) -> String {
        self.aggregate_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| self.tenant_id.clone())
    }

    fn aggregate_type(&self) -> String {
        self.aggregate_type.clone().unwrap_or_else(|| {
            self.command_name
                .split('.')
                .next()
                .unwrap_or(&self.command_name)
                .to_string()
        })
    }
}

/// Successful admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub dispatch_id: String,
    /// Epoch milliseconds.
    pub accepted_at: i64,
    pub target_topic: String,
    /// The idempotency key had already been accepted; no new row was written.
    pub deduplicated: bool,
}

/// Route and feature that admitted a command.
#[derive(Debug, Clone)]
struct Admission {
    route: CommandRoute,
    feature_status: FeatureStatus,
    limits: ThrottleLimits,
    /// A throttle token was spent on this command.
    token_taken: bool,
}

struct Forwarder {
    transport: Arc<dyn ForwardTransport>,
    breakers: Arc<CircuitBreakerRegistry>,
}

/// Admits commands and records them in the outbox.
pub struct CommandIntake {
    store: OutboxStore,
    validators: ValidatorRegistry,
    throttle: Arc<ThrottleEngine>,
    config: IntakeConfig,
    forwarder: Option<Forwarder>,
}

impl CommandIntake {
    pub fn new(
        store: OutboxStore,
        validators: ValidatorRegistry,
        throttle: Arc<ThrottleEngine>,
        config: IntakeConfig,
    ) -> Self {
        Self {
            store,
            validators,
            throttle,
            config,
            forwarder: None,
        }
    }

    /// Enable [`execute_now`](Self::execute_now).
    pub fn with_forwarder(
        mut self,
        transport: Arc<dyn ForwardTransport>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        self.forwarder = Some(Forwarder { transport, breakers });
        self
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    /// Admit `command` and write its outbox row.
    ///
    /// Returns as soon as the row is durable. Rejections write nothing and
    /// come back as [`IntakeError::Rejected`].
    pub async fn submit(&self, command: SubmitCommand) -> IntakeResult<Accepted> {
        self.validate(&command)?;

        if let Some(existing) = self.find_duplicate(&command).await? {
            return Ok(existing);
        }

        let admission = self.admit(&command).await?;
        let inserted = match self.build_event(&command, &admission.route) {
            Ok(event) => self.store.insert(event).await.map_err(IntakeError::from),
            Err(e) => Err(e),
        };
        let outcome = match inserted {
            Ok(outcome) => outcome,
            Err(e) => {
                self.refund(&command, &admission);
                return Err(e);
            }
        };

        // A duplicate here means a concurrent submit with the same key won.
        let deduplicated = outcome.is_duplicate();
        if deduplicated {
            self.refund(&command, &admission);
        }
        let stored = outcome.into_event();

        let outcome_label = if deduplicated {
            labels::DEDUPLICATED
        } else {
            labels::ACCEPTED
        };
        metrics::record_admission(&command.command_name, outcome_label);

        info!(
            dispatch_id = %stored.event_id,
            command = %command.command_name,
            tenant_id = %command.tenant_id,
            topic = %stored.target_topic,
            feature_status = admission.feature_status.as_str(),
            deduplicated,
            "Command accepted"
        );

        Ok(Accepted {
            dispatch_id: stored.event_id,
            accepted_at: stored.created_at,
            target_topic: stored.target_topic,
            deduplicated,
        })
    }

    /// Admit `command` and execute it synchronously on its target service.
    ///
    /// Nothing is written to the outbox. Fails fast with `CIRCUIT_OPEN` while
    /// the target's breaker is open.
    pub async fn execute_now(&self, command: SubmitCommand) -> IntakeResult<ForwardResponse> {
        let forwarder = self.forwarder.as_ref().ok_or(IntakeError::ForwardingDisabled)?;

        self.validate(&command)?;
        let admission = self.admit(&command).await?;
        let target = admission.route.target_service.clone();

        let request_id = Uuid::new_v4().to_string();
        let request = ForwardRequest {
            target_service: target.clone(),
            command_name: command.command_name.clone(),
            headers: self.headers(&command, &request_id, &payload_hash(&command.payload)?),
            payload: command.payload.clone(),
        };

        let breaker = forwarder.breakers.get(&target).await;
        let transport = forwarder.transport.clone();
        let result = breaker.call(|| async move { transport.forward(&request).await }).await;

        match result {
            Ok(response) => {
                metrics::record_forward_call(&target, labels::SUCCESS);
                debug!(
                    request_id = %request_id,
                    target = %target,
                    status = response.status,
                    "Command executed"
                );
                Ok(response)
            }
            Err(CircuitBreakerError::Open { target }) => {
                metrics::record_forward_call(&target, labels::REJECTED);
                metrics::record_admission(&command.command_name, RejectionCode::CircuitOpen.label());
                Err(AdmissionRejection::new(
                    RejectionCode::CircuitOpen,
                    format!("circuit open for {target}"),
                )
                .into())
            }
            Err(CircuitBreakerError::Inner(e)) => {
                metrics::record_forward_call(&target, labels::FAILURE);
                warn!(request_id = %request_id, target = %target, error = %e, "Command execution failed");
                Err(e.into())
            }
        }
    }

    fn validate(&self, command: &SubmitCommand) -> IntakeResult<()> {
        if command.command_name.trim().is_empty() {
            return Err(self.reject(command, RejectionCode::ValidationFailed, "commandName is required"));
        }
        if command.tenant_id.trim().is_empty() {
            return Err(self.reject(command, RejectionCode::ValidationFailed, "tenantId is required"));
        }

        match self.validators.get(&command.command_name) {
            Some(validator) => validator
                .validate(&command.payload)
                .map_err(|reason| self.reject(command, RejectionCode::ValidationFailed, reason)),
            None if self.config.strict_unknown_commands => Err(self.reject(
                command,
                RejectionCode::ValidationFailed,
                format!("no validator registered for {}", command.command_name),
            )),
            None => {
                debug!(command = %command.command_name, "No validator registered, passing through");
                metrics::record_admission(&command.command_name, labels::UNVALIDATED);
                Ok(())
            }
        }
    }

    async fn find_duplicate(&self, command: &SubmitCommand) -> IntakeResult<Option<Accepted>> {
        let Some(key) = command.idempotency_key.clone() else {
            return Ok(None);
        };

        let tenant_id = command.tenant_id.clone();
        let existing = self
            .store
            .database()
            .call(move |conn| queries::get_outbox_event_by_idempotency_key(conn, &tenant_id, &key))
            .await?;

        Ok(existing.map(|event| {
            metrics::record_admission(&command.command_name, labels::DEDUPLICATED);
            debug!(
                dispatch_id = %event.event_id,
                tenant_id = %command.tenant_id,
                "Idempotency key already accepted"
            );
            Accepted {
                dispatch_id: event.event_id,
                accepted_at: event.created_at,
                target_topic: event.target_topic,
                deduplicated: true,
            }
        }))
    }

    async fn admit(&self, command: &SubmitCommand) -> IntakeResult<Admission> {
        let (routes, feature) = self.resolve(command).await?;

        let route = choose_route(&routes, &mut rand::thread_rng()).cloned().ok_or_else(|| {
            self.reject(
                command,
                RejectionCode::RouteNotFound,
                format!(
                    "no active route for {} in {}",
                    command.command_name, self.config.environment
                ),
            )
        })?;

        // No feature row means enabled without limits.
        let (feature_status, limits) = match &feature {
            Some(f) => (f.status, ThrottleLimits::new(f.max_per_minute, f.burst)),
            None => (FeatureStatus::Enabled, ThrottleLimits::unlimited()),
        };

        if feature_status == FeatureStatus::Disabled {
            return Err(self.reject(
                command,
                RejectionCode::CommandDisabled,
                format!("{} is disabled", command.command_name),
            ));
        }

        let token_taken = self
            .throttle
            .allow(&command.tenant_id, &command.command_name, &limits);
        if !token_taken {
            match feature_status {
                FeatureStatus::Observation => {
                    warn!(
                        command = %command.command_name,
                        tenant_id = %command.tenant_id,
                        "Throttle limit exceeded (observation only)"
                    );
                    metrics::record_admission(&command.command_name, labels::OBSERVED);
                }
                _ => {
                    return Err(self.reject(
                        command,
                        RejectionCode::Throttled,
                        format!(
                            "rate limit exceeded for {} on tenant {}",
                            command.command_name, command.tenant_id
                        ),
                    ));
                }
            }
        }

        Ok(Admission {
            route,
            feature_status,
            limits,
            token_taken,
        })
    }

    /// Hand back the throttle token of a command that was never recorded.
    fn refund(&self, command: &SubmitCommand, admission: &Admission) {
        if admission.token_taken {
            self.throttle
                .refund(&command.tenant_id, &command.command_name, &admission.limits);
        }
    }

    async fn resolve(&self, command: &SubmitCommand) -> IntakeResult<(Vec<CommandRoute>, Option<CommandFeature>)> {
        let name = command.command_name.clone();
        let environment = self.config.environment.clone();
        let tenant_id = command.tenant_id.clone();

        let resolved = self
            .store
            .database()
            .call(move |conn| {
                let routes = queries::resolve_command_routes(conn, &name, &environment, &tenant_id)?;
                let feature = queries::resolve_command_feature(conn, &name, &environment, &tenant_id)?;
                Ok((routes, feature))
            })
            .await?;
        Ok(resolved)
    }

    fn build_event(&self, command: &SubmitCommand, route: &CommandRoute) -> IntakeResult<NewOutboxEvent> {
        let event_id = Uuid::new_v4().to_string();
        let payload_hash = payload_hash(&command.payload)?;

        Ok(NewOutboxEvent {
            headers: self.headers(command, &event_id, &payload_hash),
            event_id,
            tenant_id: command.tenant_id.clone(),
            aggregate_id: command.aggregate_id.clone(),
            aggregate_type: command.aggregate_type(),
            event_type: command.command_name.clone(),
            payload: command.payload.clone(),
            target_topic: route.target_topic.clone(),
            target_service: Some(route.target_service.clone()),
            priority: command.priority,
            correlation_id: command.correlation_id.clone(),
            partition_key: command.partition_key(),
            idempotency_key: command.idempotency_key.clone(),
            payload_hash,
            available_at: now_ms(),
        })
    }

    fn headers(&self, command: &SubmitCommand, request_id: &str, payload_hash: &str) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::from([
            (COMMAND_NAME_HEADER.to_string(), command.command_name.clone()),
            (TENANT_ID_HEADER.to_string(), command.tenant_id.clone()),
            (REQUEST_ID_HEADER.to_string(), request_id.to_string()),
            (PAYLOAD_HASH_HEADER.to_string(), payload_hash.to_string()),
        ]);
        if let Some(correlation_id) = &command.correlation_id {
            headers.insert(CORRELATION_ID_HEADER.to_string(), correlation_id.clone());
        }
        if let Some(initiated_by) = &command.initiated_by {
            headers.insert(INITIATED_BY_HEADER.to_string(), initiated_by.clone());
        }
        headers
    }

    fn reject(&self, command: &SubmitCommand, code: RejectionCode, message: impl Into<String>) -> IntakeError {
        let rejection = AdmissionRejection::new(code, message);
        metrics::record_admission(&command.command_name, code.label());
        info!(
            command = %command.command_name,
            tenant_id = %command.tenant_id,
            code = %code,
            reason = %rejection.message,
            "Command rejected"
        );
        rejection.into()
    }
}

/// SHA-256 of the payload's canonical JSON, hex encoded.
///
/// `serde_json` maps keep keys sorted, so equal payloads hash equally
/// regardless of the order their keys arrived in.
pub fn payload_hash(payload: &Value) -> IntakeResult<String> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ForwardError, RequiredFields};
    use async_trait::async_trait;
    use circuit_breaker_registry::CircuitBreakerConfig;
    use dispatch_database::{
        AsyncDatabase, NewCommandFeature, NewCommandRoute, OutboxStatus, RouteStatus,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const ENV: &str = "production";
    const COMMAND: &str = "order.create";

    async fn setup() -> (CommandIntake, OutboxStore) {
        setup_with(ValidatorRegistry::new(), false).await
    }

    async fn setup_with(validators: ValidatorRegistry, strict: bool) -> (CommandIntake, OutboxStore) {
        setup_sharing(validators, strict, Arc::new(ThrottleEngine::new())).await
    }

    async fn setup_sharing(
        validators: ValidatorRegistry,
        strict: bool,
        throttle: Arc<ThrottleEngine>,
    ) -> (CommandIntake, OutboxStore) {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let store = OutboxStore::with_instance_id(db, "intake-test");
        let intake = CommandIntake::new(
            store.clone(),
            validators,
            throttle,
            IntakeConfig {
                environment: ENV.to_string(),
                strict_unknown_commands: strict,
            },
        );
        (intake, store)
    }

    async fn add_route(store: &OutboxStore, tenant: Option<&str>, topic: &str, status: RouteStatus) {
        let route = NewCommandRoute {
            command_name: COMMAND.to_string(),
            environment: ENV.to_string(),
            tenant_id: tenant.map(String::from),
            target_service: "orders".to_string(),
            target_topic: topic.to_string(),
            weight: 100,
            status,
        };
        store
            .database()
            .call(move |conn| queries::upsert_command_route(conn, &route, 0))
            .await
            .unwrap();
    }

    async fn set_feature(store: &OutboxStore, status: FeatureStatus, max_per_minute: Option<i64>, burst: Option<i64>) {
        let feature = NewCommandFeature {
            command_name: COMMAND.to_string(),
            environment: ENV.to_string(),
            tenant_id: None,
            status,
            max_per_minute,
            burst,
        };
        store
            .database()
            .call(move |conn| queries::upsert_command_feature(conn, &feature, 0))
            .await
            .unwrap();
    }

    async fn row_count(store: &OutboxStore) -> u64 {
        store.counts().await.unwrap().iter().map(|(_, n)| n).sum()
    }

    fn command(tenant: &str) -> SubmitCommand {
        SubmitCommand::new(COMMAND, tenant, json!({"orderId": "o-1", "amount": 42}))
    }

    #[tokio::test]
    async fn submit_writes_one_pending_row() {
        let (intake, store) = setup().await;
        add_route(&store, None, "orders", RouteStatus::Active).await;

        let cmd = command("tenant-a")
            .with_correlation_id("corr-1")
            .with_initiated_by("user-9");
        let accepted = intake.submit(cmd.clone()).await.unwrap();
        assert!(!accepted.deduplicated);
        assert_eq!(accepted.target_topic, "orders");

        let event = store.get(&accepted.dispatch_id).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.event_type, COMMAND);
        assert_eq!(event.aggregate_type, "order");
        assert_eq!(event.partition_key, "tenant-a");
        assert_eq!(event.target_service.as_deref(), Some("orders"));
        assert_eq!(event.created_at, accepted.accepted_at);
        assert_eq!(event.payload, cmd.payload);
        assert_eq!(event.payload_hash, payload_hash(&cmd.payload).unwrap());

        assert_eq!(event.headers[COMMAND_NAME_HEADER], COMMAND);
        assert_eq!(event.headers[TENANT_ID_HEADER], "tenant-a");
        assert_eq!(event.headers[REQUEST_ID_HEADER], accepted.dispatch_id);
        assert_eq!(event.headers[CORRELATION_ID_HEADER], "corr-1");
        assert_eq!(event.headers[INITIATED_BY_HEADER], "user-9");
        assert_eq!(event.headers[PAYLOAD_HASH_HEADER], event.payload_hash);

        assert_eq!(row_count(&store).await, 1);
    }

    #[tokio::test]
    async fn aggregate_id_becomes_partition_key() {
        let (intake, store) = setup().await;
        add_route(&store, None, "orders", RouteStatus::Active).await;

        let accepted = intake
            .submit(command("tenant-a").with_aggregate("cart", "cart-7").with_priority(-1))
            .await
            .unwrap();

        let event = store.get(&accepted.dispatch_id).await.unwrap().unwrap();
        assert_eq!(event.partition_key, "cart-7");
        assert_eq!(event.aggregate_type, "cart");
        assert_eq!(event.priority, -1);
    }

    #[tokio::test]
    async fn missing_or_disabled_route_is_rejected_without_a_row() {
        let (intake, store) = setup().await;

        let err = intake.submit(command("tenant-a")).await.unwrap_err();
        assert_eq!(err.rejection_code(), Some(RejectionCode::RouteNotFound));

        add_route(&store, None, "orders", RouteStatus::Disabled).await;
        let err = intake.submit(command("tenant-a")).await.unwrap_err();
        assert_eq!(err.rejection_code(), Some(RejectionCode::RouteNotFound));

        assert_eq!(row_count(&store).await, 0);
    }

    #[tokio::test]
    async fn tenant_route_overrides_global() {
        let (intake, store) = setup().await;
        add_route(&store, None, "orders", RouteStatus::Active).await;
        add_route(&store, Some("tenant-vip"), "orders-vip", RouteStatus::Active).await;

        assert_eq!(intake.submit(command("tenant-vip")).await.unwrap().target_topic, "orders-vip");
        assert_eq!(intake.submit(command("tenant-a")).await.unwrap().target_topic, "orders");
    }

    #[tokio::test]
    async fn disabled_feature_is_rejected() {
        let (intake, store) = setup().await;
        add_route(&store, None, "orders", RouteStatus::Active).await;
        set_feature(&store, FeatureStatus::Disabled, None, None).await;

        let err = intake.submit(command("tenant-a")).await.unwrap_err();
        assert_eq!(err.rejection_code(), Some(RejectionCode::CommandDisabled));
        assert_eq!(err.to_string(), "Command rejected: COMMAND_DISABLED: order.create is disabled");
        assert_eq!(row_count(&store).await, 0);
    }

    #[tokio::test]
    async fn enabled_feature_throttles_per_tenant() {
        let (intake, store) = setup().await;
        add_route(&store, None, "orders", RouteStatus::Active).await;
        set_feature(&store, FeatureStatus::Enabled, Some(60), Some(2)).await;

        intake.submit(command("tenant-a")).await.unwrap();
        intake.submit(command("tenant-a")).await.unwrap();
        let err = intake.submit(command("tenant-a")).await.unwrap_err();
        assert_eq!(err.rejection_code(), Some(RejectionCode::Throttled));

        // Buckets are per tenant
        intake.submit(command("tenant-b")).await.unwrap();
        assert_eq!(row_count(&store).await, 3);
    }

    #[tokio::test]
    async fn observation_feature_never_rejects() {
        let (intake, store) = setup().await;
        add_route(&store, None, "orders", RouteStatus::Active).await;
        set_feature(&store, FeatureStatus::Observation, Some(1), Some(1)).await;

        for _ in 0..3 {
            intake.submit(command("tenant-a")).await.unwrap();
        }
        assert_eq!(row_count(&store).await, 3);
    }

    #[tokio::test]
    async fn validation_by_command_name() {
        let validators = ValidatorRegistry::new().with(COMMAND, RequiredFields::new(["orderId", "amount"]));
        let (intake, store) = setup_with(validators, false).await;
        add_route(&store, None, "orders", RouteStatus::Active).await;

        let err = intake
            .submit(SubmitCommand::new(COMMAND, "tenant-a", json!({"orderId": "o-1"})))
            .await
            .unwrap_err();
        let rejection = err.rejection().unwrap();
        assert_eq!(rejection.code, RejectionCode::ValidationFailed);
        assert_eq!(rejection.message, "missing required fields: amount");

        intake.submit(command("tenant-a")).await.unwrap();

        let err = intake
            .submit(SubmitCommand::new(COMMAND, "  ", json!({"orderId": "o-1", "amount": 1})))
            .await
            .unwrap_err();
        assert_eq!(err.rejection_code(), Some(RejectionCode::ValidationFailed));
        assert_eq!(row_count(&store).await, 1);
    }

    #[tokio::test]
    async fn unknown_commands_pass_unless_strict() {
        let (intake, store) = setup().await;
        add_route(&store, None, "orders", RouteStatus::Active).await;
        intake.submit(command("tenant-a")).await.unwrap();

        let (strict, store) = setup_with(ValidatorRegistry::new(), true).await;
        add_route(&store, None, "orders", RouteStatus::Active).await;
        let err = strict.submit(command("tenant-a")).await.unwrap_err();
        assert_eq!(err.rejection_code(), Some(RejectionCode::ValidationFailed));
    }

    #[tokio::test]
    async fn repeated_idempotency_key_returns_original_dispatch() {
        let (intake, store) = setup().await;
        add_route(&store, None, "orders", RouteStatus::Active).await;
        set_feature(&store, FeatureStatus::Enabled, Some(1), Some(1)).await;

        let first = intake
            .submit(command("tenant-a").with_idempotency_key("order-o-1"))
            .await
            .unwrap();
        // The bucket is now empty, but a replay is not a new admission
        let second = intake
            .submit(command("tenant-a").with_idempotency_key("order-o-1"))
            .await
            .unwrap();

        assert_eq!(second.dispatch_id, first.dispatch_id);
        assert_eq!(second.accepted_at, first.accepted_at);
        assert!(second.deduplicated);
        assert_eq!(row_count(&store).await, 1);
    }

    #[tokio::test]
    async fn racing_replays_spend_one_token() {
        let (intake, store) = setup().await;
        add_route(&store, None, "orders", RouteStatus::Active).await;
        set_feature(&store, FeatureStatus::Enabled, Some(1), Some(2)).await;

        let (a, b) = tokio::join!(
            intake.submit(command("tenant-a").with_idempotency_key("order-o-1")),
            intake.submit(command("tenant-a").with_idempotency_key("order-o-1")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.dispatch_id, b.dispatch_id);
        assert!(a.deduplicated != b.deduplicated);
        assert_eq!(row_count(&store).await, 1);

        // Whichever submit lost the race gave its token back
        intake.submit(command("tenant-a")).await.unwrap();
        let err = intake.submit(command("tenant-a")).await.unwrap_err();
        assert_eq!(err.rejection_code(), Some(RejectionCode::Throttled));
    }

    #[tokio::test]
    async fn failed_write_refunds_its_token() {
        let throttle = Arc::new(ThrottleEngine::new());
        let (intake, store) = setup_sharing(ValidatorRegistry::new(), false, throttle.clone()).await;
        add_route(&store, None, "orders", RouteStatus::Active).await;
        set_feature(&store, FeatureStatus::Enabled, Some(1), Some(1)).await;
        store
            .database()
            .call_sqlite(|conn| conn.execute_batch("DROP TABLE outbox_events"))
            .await
            .unwrap();

        let err = intake.submit(command("tenant-a")).await.unwrap_err();
        assert!(err.rejection().is_none());

        let limits = ThrottleLimits::new(Some(1), Some(1));
        assert!(throttle.allow("tenant-a", COMMAND, &limits));
        assert!(!throttle.allow("tenant-a", COMMAND, &limits));
    }

    #[test]
    fn payload_hash_ignores_key_order() {
        let a = json!({"a": 1, "b": {"c": true, "d": [1, 2]}});
        let b: Value = serde_json::from_str(r#"{"b": {"d": [1, 2], "c": true}, "a": 1}"#).unwrap();
        assert_eq!(payload_hash(&a).unwrap(), payload_hash(&b).unwrap());
        assert_eq!(payload_hash(&a).unwrap().len(), 64);
        assert_ne!(payload_hash(&a).unwrap(), payload_hash(&json!({"a": 2})).unwrap());
    }

    // ------------------------------------------------------------------
    // execute_now
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct FakeTransport {
        failing: AtomicBool,
        calls: AtomicUsize,
        requests: Mutex<Vec<ForwardRequest>>,
    }

    #[async_trait]
    impl ForwardTransport for FakeTransport {
        async fn forward(&self, request: &ForwardRequest) -> Result<ForwardResponse, ForwardError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if self.failing.load(Ordering::SeqCst) {
                return Err(ForwardError::Status {
                    service: request.target_service.clone(),
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(ForwardResponse {
                status: 200,
                body: json!({"ok": true}),
            })
        }
    }

    async fn setup_forwarding(threshold: u32) -> (CommandIntake, OutboxStore, Arc<FakeTransport>) {
        let (intake, store) = setup().await;
        add_route(&store, None, "orders", RouteStatus::Active).await;

        let transport = Arc::new(FakeTransport::default());
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(60),
        }));
        let intake = intake.with_forwarder(transport.clone(), breakers);
        (intake, store, transport)
    }

    #[tokio::test]
    async fn execute_now_forwards_without_writing_the_outbox() {
        let (intake, store, transport) = setup_forwarding(2).await;

        let response = intake
            .execute_now(command("tenant-a").with_correlation_id("corr-1"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({"ok": true}));

        let requests = transport.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].target_service, "orders");
        assert_eq!(requests[0].command_name, COMMAND);
        assert_eq!(requests[0].headers[TENANT_ID_HEADER], "tenant-a");
        assert_eq!(requests[0].headers[CORRELATION_ID_HEADER], "corr-1");

        assert_eq!(row_count(&store).await, 0);
    }

    #[tokio::test]
    async fn execute_now_fails_fast_once_circuit_opens() {
        let (intake, _store, transport) = setup_forwarding(2).await;
        transport.failing.store(true, Ordering::SeqCst);

        for _ in 0..2 {
            let err = intake.execute_now(command("tenant-a")).await.unwrap_err();
            assert!(matches!(err, IntakeError::Forward(ForwardError::Status { status: 503, .. })));
        }

        let err = intake.execute_now(command("tenant-a")).await.unwrap_err();
        assert_eq!(err.rejection_code(), Some(RejectionCode::CircuitOpen));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn execute_now_runs_admission_first() {
        let (intake, store, transport) = setup_forwarding(2).await;
        set_feature(&store, FeatureStatus::Disabled, None, None).await;

        let err = intake.execute_now(command("tenant-a")).await.unwrap_err();
        assert_eq!(err.rejection_code(), Some(RejectionCode::CommandDisabled));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn execute_now_requires_a_forwarder() {
        let (intake, store) = setup().await;
        add_route(&store, None, "orders", RouteStatus::Active).await;

        let err = intake.execute_now(command("tenant-a")).await.unwrap_err();
        assert!(matches!(err, IntakeError::ForwardingDisabled));
    }
}

//! Database model types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Outbox row - one per accepted command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub event_id: String,
    pub tenant_id: String,
    pub aggregate_id: Option<String>,
    pub aggregate_type: String,
    /// Command name.
    pub event_type: String,
    pub payload: Value,
    pub headers: BTreeMap<String, String>,
    pub target_topic: String,
    pub target_service: Option<String>,
    pub status: OutboxStatus,
    pub available_at: i64,
    pub locked_at: Option<i64>,
    pub locked_by: Option<String>,
    pub retry_count: u32,
    /// Lower values are claimed first.
    pub priority: i64,
    pub correlation_id: Option<String>,
    pub partition_key: String,
    pub idempotency_key: Option<String>,
    pub payload_hash: String,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub delivered_at: Option<i64>,
}

/// Outbox delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Claimed,
    Delivered,
    Retrying,
    Dead,
}

impl Default for OutboxStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 5] = [
        Self::Pending,
        Self::Claimed,
        Self::Delivered,
        Self::Retrying,
        Self::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Delivered => "delivered",
            Self::Retrying => "retrying",
            Self::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "claimed" => Self::Claimed,
            "delivered" => Self::Delivered,
            "retrying" => Self::Retrying,
            "dead" => Self::Dead,
            _ => Self::Pending,
        }
    }

    /// Whether the row will not be touched by the dispatcher again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Dead)
    }
}

/// New outbox row for insertion.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_id: String,
    pub tenant_id: String,
    pub aggregate_id: Option<String>,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: Value,
    pub headers: BTreeMap<String, String>,
    pub target_topic: String,
    pub target_service: Option<String>,
    pub priority: i64,
    pub correlation_id: Option<String>,
    pub partition_key: String,
    pub idempotency_key: Option<String>,
    pub payload_hash: String,
    pub available_at: i64,
}

/// Result of an outbox insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// A new row was written.
    Inserted(OutboxEvent),
    /// A row with the same `(tenant_id, idempotency_key)` already existed.
    Duplicate(OutboxEvent),
}

impl InsertOutcome {
    pub fn event(&self) -> &OutboxEvent {
        match self {
            Self::Inserted(event) | Self::Duplicate(event) => event,
        }
    }

    pub fn into_event(self) -> OutboxEvent {
        match self {
            Self::Inserted(event) | Self::Duplicate(event) => event,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Routing row for a command. `tenant_id = None` is the global row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRoute {
    pub id: String,
    pub command_name: String,
    pub environment: String,
    pub tenant_id: Option<String>,
    pub target_service: String,
    pub target_topic: String,
    pub weight: u32,
    pub status: RouteStatus,
    pub updated_at: i64,
}

/// Route status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStatus {
    Active,
    Disabled,
}

impl Default for RouteStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl RouteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "disabled" => Self::Disabled,
            _ => Self::Active,
        }
    }
}

/// New or updated route. Identity is `(command, environment, tenant, topic)`.
#[derive(Debug, Clone)]
pub struct NewCommandRoute {
    pub command_name: String,
    pub environment: String,
    pub tenant_id: Option<String>,
    pub target_service: String,
    pub target_topic: String,
    pub weight: u32,
    pub status: RouteStatus,
}

/// Feature flag and throttle limits for a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFeature {
    pub id: String,
    pub command_name: String,
    pub environment: String,
    pub tenant_id: Option<String>,
    pub status: FeatureStatus,
    pub max_per_minute: Option<i64>,
    pub burst: Option<i64>,
    pub updated_at: i64,
}

/// Feature status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureStatus {
    Enabled,
    /// Throttle decisions are logged but never enforced.
    Observation,
    Disabled,
}

impl Default for FeatureStatus {
    fn default() -> Self {
        Self::Enabled
    }
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Observation => "observation",
            Self::Disabled => "disabled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "observation" => Self::Observation,
            "disabled" => Self::Disabled,
            _ => Self::Enabled,
        }
    }
}

/// New or updated feature row. Identity is `(command, environment, tenant)`.
#[derive(Debug, Clone)]
pub struct NewCommandFeature {
    pub command_name: String,
    pub environment: String,
    pub tenant_id: Option<String>,
    pub status: FeatureStatus,
    pub max_per_minute: Option<i64>,
    pub burst: Option<i64>,
}

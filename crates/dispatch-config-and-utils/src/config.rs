//! Configuration management for the dispatcher.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default deployment environment used for route and feature lookups.
pub const DEFAULT_ENVIRONMENT: &str = "production";

/// Main dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Environment name matched against route and feature rows.
    pub environment: String,
    /// Optional override for the outbox database location.
    pub database_path: Option<PathBuf>,
    /// Claim loop settings.
    pub dispatcher: DispatcherSettings,
    /// Delivery retry policy.
    pub retry: RetrySettings,
    /// Per-tenant publish spacing.
    pub publish_throttle: PublishThrottleSettings,
    /// Circuit breaker defaults for synchronous forwarding.
    pub circuit_breaker: CircuitBreakerSettings,
    /// Broker connection.
    pub broker: BrokerConfig,
    /// Command intake policy.
    pub intake: IntakeSettings,
    /// Target service name -> base URL, used for synchronous forwarding.
    pub services: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            database_path: None,
            dispatcher: DispatcherSettings::default(),
            retry: RetrySettings::default(),
            publish_throttle: PublishThrottleSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            broker: BrokerConfig::default(),
            intake: IntakeSettings::default(),
            services: HashMap::new(),
        }
    }
}

/// Outbox claim loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Maximum rows claimed per poll.
    pub batch_size: usize,
    /// Sleep between polls when the previous poll claimed nothing.
    pub poll_interval_ms: u64,
    /// A claim older than this is considered abandoned and may be re-claimed.
    pub claim_timeout_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval_ms: 500,
            claim_timeout_ms: 60_000,
        }
    }
}

/// Delivery retry policy shared by the dispatcher and the retry engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Delivery attempts before a row is dead-lettered.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_delay_ms: u64,
    /// Fixed delay schedule; overrides exponential backoff when present.
    pub delay_schedule_ms: Option<Vec<u64>>,
    /// Jitter as a fraction of the computed delay.
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay_ms: 1_000,
            delay_schedule_ms: None,
            jitter_factor: 0.2,
        }
    }
}

/// Per-tenant publish spacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishThrottleSettings {
    /// Minimum spacing between two publishes for the same tenant.
    pub min_spacing_ms: u64,
    /// Upper bound of the uniform jitter added to each wait.
    pub max_jitter_ms: u64,
}

impl Default for PublishThrottleSettings {
    fn default() -> Self {
        Self {
            min_spacing_ms: 0,
            max_jitter_ms: 0,
        }
    }
}

/// Circuit breaker defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time the circuit stays open before allowing a trial call.
    pub reset_timeout_ms: u64,
    /// Request timeout for synchronous forwarding calls.
    pub request_timeout_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            request_timeout_secs: 10,
        }
    }
}

/// Which broker implementation to publish to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Redis Streams.
    Redis,
    /// Process-local broker, for development only.
    Memory,
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker implementation.
    pub kind: BrokerKind,
    /// Redis connection URL.
    pub redis_url: String,
    /// Number of partition streams per topic (1 = unpartitioned).
    pub partitions: u32,
    /// Suffix appended to a topic name to form its dead-letter topic.
    pub dead_letter_suffix: String,
    /// Approximate maximum stream length (XADD MAXLEN ~), 0 disables trimming.
    pub max_stream_len: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            partitions: 1,
            dead_letter_suffix: ".dead-letter".to_string(),
            max_stream_len: 0,
        }
    }
}

/// Command intake policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeSettings {
    /// Reject commands that have no registered validator.
    pub strict_unknown_commands: bool,
}

impl Config {
    /// Load configuration from `<base>/config.json`, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Database location, honouring the `database_path` override.
    pub fn database_file(&self, paths: &Paths) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| paths.database_file())
    }

    /// Base URL for a target service, if one is configured.
    pub fn service_url(&self, service: &str) -> CoreResult<Option<Url>> {
        self.services
            .get(service)
            .map(|raw| Url::parse(raw).map_err(CoreError::from))
            .transpose()
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.dispatcher.batch_size == 0 {
            return Err(CoreError::Config(
                "dispatcher.batch_size must be at least 1".to_string(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(CoreError::Config(
                "retry.max_retries must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(CoreError::Config(
                "retry.jitter_factor must be within 0.0..=1.0".to_string(),
            ));
        }
        if matches!(&self.retry.delay_schedule_ms, Some(schedule) if schedule.is_empty()) {
            return Err(CoreError::Config(
                "retry.delay_schedule_ms must not be empty when set".to_string(),
            ));
        }
        if self.broker.partitions == 0 {
            return Err(CoreError::Config(
                "broker.partitions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Some(log_level) = env_non_empty("DISPATCH_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Some(environment) = env_non_empty("DISPATCH_ENVIRONMENT") {
            self.environment = environment;
        }
        if let Some(path) = env_non_empty("DISPATCH_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(redis_url) = env_non_empty("REDIS_URL") {
            self.broker.redis_url = redis_url;
        }
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.environment, DEFAULT_ENVIRONMENT);
        assert_eq!(config.dispatcher.batch_size, 50);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.reset_timeout_ms, 30_000);
        assert_eq!(config.broker.kind, BrokerKind::Redis);
        assert!(!config.intake.strict_unknown_commands);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_load_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "retry": { "max_retries": 3, "delay_schedule_ms": [100, 500] },
            "broker": { "kind": "memory" },
            "services": { "billing": "http://billing.internal:8080" }
        }"#;
        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.retry.delay_schedule_ms, Some(vec![100, 500]));
        assert_eq!(config.broker.kind, BrokerKind::Memory);
        assert_eq!(config.broker.dead_letter_suffix, ".dead-letter");
        assert_eq!(config.dispatcher.claim_timeout_ms, 60_000);

        let url = config.service_url("billing").unwrap().unwrap();
        assert_eq!(url.port(), Some(8080));
        assert!(config.service_url("unknown").unwrap().is_none());
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.environment = "staging".to_string();
        config.publish_throttle.min_spacing_ms = 25;
        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.environment, "staging");
        assert_eq!(loaded.publish_throttle.min_spacing_ms, 25);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.dispatcher.poll_interval_ms, 500);
    }

    #[test]
    fn test_database_file_override() {
        let paths = Paths::with_base_dir(PathBuf::from("/srv/dispatch"));
        let mut config = Config::default();
        assert_eq!(
            config.database_file(&paths),
            PathBuf::from("/srv/dispatch/dispatch.sqlite")
        );

        config.database_path = Some(PathBuf::from("/data/outbox.db"));
        assert_eq!(config.database_file(&paths), PathBuf::from("/data/outbox.db"));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = Config::default();
        config.retry.jitter_factor = 1.5;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let mut config = Config::default();
        config.retry.delay_schedule_ms = Some(vec![]);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dispatcher.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.broker.partitions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_service_url() {
        let mut config = Config::default();
        config
            .services
            .insert("broken".to_string(), "not a url".to_string());
        assert!(config.service_url("broken").is_err());
    }
}

//! Synchronous forwarding to target services.

use crate::ForwardError;
use async_trait::async_trait;
use dispatch_config_and_utils::Config;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// One command to execute immediately on its target service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardRequest {
    pub target_service: String,
    pub command_name: String,
    pub payload: Value,
    pub headers: BTreeMap<String, String>,
}

/// Answer from the target service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardResponse {
    pub status: u16,
    pub body: Value,
}

/// Carries a command to its target service.
///
/// Returning `Err` counts as a failure for the target's circuit breaker;
/// a well-formed refusal by the service (4xx) should be returned as `Ok`.
#[async_trait]
pub trait ForwardTransport: Send + Sync {
    async fn forward(&self, request: &ForwardRequest) -> Result<ForwardResponse, ForwardError>;
}

/// HTTP transport: `POST {base_url}/commands/{command_name}` with the payload
/// as JSON body and the command headers as `x-` prefixed HTTP headers.
pub struct HttpForwardTransport {
    client: Client,
    services: HashMap<String, Url>,
}

impl HttpForwardTransport {
    pub fn new(services: HashMap<String, Url>, timeout: Duration) -> Result<Self, ForwardError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, services })
    }

    /// Build from the `services` and `circuit_breaker` sections of the config.
    pub fn from_config(config: &Config) -> Result<Self, ForwardError> {
        let mut services = HashMap::new();
        for (name, base) in &config.services {
            services.insert(name.clone(), Url::parse(base)?);
        }
        Self::new(
            services,
            Duration::from_secs(config.circuit_breaker.request_timeout_secs),
        )
    }

    /// Endpoint for `request`, or `UnknownService`.
    pub fn endpoint(&self, request: &ForwardRequest) -> Result<Url, ForwardError> {
        let base = self
            .services
            .get(&request.target_service)
            .ok_or_else(|| ForwardError::UnknownService(request.target_service.clone()))?;
        command_endpoint(base, &request.command_name)
    }
}

/// `{base}/commands/{command_name}`, keeping any path prefix on `base`.
pub fn command_endpoint(base: &Url, command_name: &str) -> Result<Url, ForwardError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(&format!("commands/{command_name}"))?)
}

/// `correlationId` -> `x-correlation-id`.
fn header_name(key: &str) -> String {
    let mut name = String::from("x-");
    for (i, ch) in key.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                name.push('-');
            }
            name.push(ch.to_ascii_lowercase());
        } else {
            name.push(ch);
        }
    }
    name
}

#[async_trait]
impl ForwardTransport for HttpForwardTransport {
    async fn forward(&self, request: &ForwardRequest) -> Result<ForwardResponse, ForwardError> {
        let url = self.endpoint(request)?;

        let mut builder = self.client.post(url.clone()).json(&request.payload);
        for (key, value) in &request.headers {
            builder = builder.header(header_name(key), value);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_server_error() {
            warn!(
                service = %request.target_service,
                url = %url,
                status = status.as_u16(),
                "Forwarded command failed"
            );
            return Err(ForwardError::Status {
                service: request.target_service.clone(),
                status: status.as_u16(),
                body: text,
            });
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        debug!(
            service = %request.target_service,
            url = %url,
            status = status.as_u16(),
            "Forwarded command"
        );
        Ok(ForwardResponse {
            status: status.as_u16(),
            body,
        })
    }
}

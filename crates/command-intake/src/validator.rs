//! Payload validators, looked up by command name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Validates the payload of one command.
pub trait PayloadValidator: Send + Sync {
    /// `Err` carries a human-readable reason.
    fn validate(&self, payload: &Value) -> Result<(), String>;
}

impl<F> PayloadValidator for F
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, payload: &Value) -> Result<(), String> {
        self(payload)
    }
}

/// Payload must be a JSON object containing every listed field.
#[derive(Debug, Clone)]
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl PayloadValidator for RequiredFields {
    fn validate(&self, payload: &Value) -> Result<(), String> {
        let object = payload
            .as_object()
            .ok_or_else(|| "payload must be a JSON object".to_string())?;

        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|field| object.get(field.as_str()).map_or(true, Value::is_null))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required fields: {}", missing.join(", ")))
        }
    }
}

/// Command name -> validator, populated at startup.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn PayloadValidator>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `validator` for `command_name`, replacing any previous one.
    pub fn register(&mut self, command_name: impl Into<String>, validator: impl PayloadValidator + 'static) {
        self.validators.insert(command_name.into(), Arc::new(validator));
    }

    pub fn with(mut self, command_name: impl Into<String>, validator: impl PayloadValidator + 'static) -> Self {
        self.register(command_name, validator);
        self
    }

    pub fn get(&self, command_name: &str) -> Option<&Arc<dyn PayloadValidator>> {
        self.validators.get(command_name)
    }

    pub fn contains(&self, command_name: &str) -> bool {
        self.validators.contains_key(command_name)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

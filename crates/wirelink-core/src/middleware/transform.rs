//! Envelope normalization, schema validation and payload sanitization
//!
//! Outgoing messages get the envelope fields the server expects (`id`,
//! `timestamp`, `version`). Incoming messages are validated against the
//! envelope schema, stripped of prototype-pollution keys and inline script
//! fragments, and stamped with their local receive time.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use super::{MessageMiddleware, MiddlewareResult, MiddlewareStats};
use crate::config::{ClientConfig, TransformConfig};
use crate::errors::ValidationError;
use crate::message::{generate_message_id, Message, META_CLIENT_RECEIVED, PROTOCOL_VERSION};
use crate::types::SharedTimeSource;

/// Keys removed from every object in an incoming payload
const FORBIDDEN_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

static SCRIPT_TAG: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").ok());

// ----------------------------------------------------------------------------
// Schema and Sanitization
// ----------------------------------------------------------------------------

/// Check that an incoming message carries a complete envelope
pub fn validate_schema(message: &Message) -> Result<(), ValidationError> {
    if !message.kind.is_known() {
        return Err(ValidationError::UnknownType {
            kind: message.kind.to_string(),
        });
    }
    if message.timestamp.is_none() {
        return Err(ValidationError::InvalidTimestamp);
    }
    if message.id.is_none() {
        return Err(ValidationError::MissingField { field: "id" });
    }
    if message.data.is_none() {
        return Err(ValidationError::MissingField { field: "data" });
    }
    Ok(())
}

/// Remove forbidden keys and script fragments, keeping everything else
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let cleaned: Map<String, Value> = object
                .into_iter()
                .filter(|(key, _)| !FORBIDDEN_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key, sanitize_value(value)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::String(text) => Value::String(strip_scripts(text)),
        other => other,
    }
}

fn strip_scripts(text: String) -> String {
    match SCRIPT_TAG.as_ref() {
        Some(pattern) if pattern.is_match(&text) => pattern.replace_all(&text, "").into_owned(),
        _ => text,
    }
}

// ----------------------------------------------------------------------------
// Transform Middleware
// ----------------------------------------------------------------------------

/// Normalizes outgoing envelopes and validates incoming ones
pub struct TransformMiddleware {
    config: TransformConfig,
    time_source: SharedTimeSource,
    stats: MiddlewareStats,
}

impl TransformMiddleware {
    pub fn new(config: TransformConfig, time_source: SharedTimeSource) -> Self {
        Self {
            config,
            time_source,
            stats: MiddlewareStats::default(),
        }
    }
}

impl MessageMiddleware for TransformMiddleware {
    fn name(&self) -> &'static str {
        "transform"
    }

    fn incoming(&mut self, mut message: Message) -> MiddlewareResult {
        if self.config.validate_schema {
            if let Err(e) = validate_schema(&message) {
                warn!(error = %e, kind = %message.kind, "Dropping message that failed validation");
                return Ok(self.stats.pass(None));
            }
        }

        if self.config.sanitize_content {
            message.data = message.data.map(sanitize_value);
        }

        if self.config.include_metadata {
            let received = self.time_source.now().as_millis();
            message
                .metadata
                .insert(META_CLIENT_RECEIVED.to_string(), Value::from(received));
        }

        Ok(self.stats.pass(Some(message)))
    }

    fn outgoing(&mut self, mut message: Message) -> MiddlewareResult {
        if message.kind.as_str().trim().is_empty() {
            self.stats.processed += 1;
            self.stats.errors += 1;
            return Err(ValidationError::MissingField { field: "type" }.into());
        }
        if message.id.as_deref().map_or(true, str::is_empty) {
            message.id = Some(generate_message_id());
        }
        if message.timestamp.is_none() {
            message.timestamp = Some(self.time_source.now());
        }
        if message.version.is_none() {
            message.version = Some(PROTOCOL_VERSION.to_string());
        }
        Ok(self.stats.pass(Some(message)))
    }

    fn reconfigure(&mut self, config: &ClientConfig) {
        self.config = config.middleware.transform.clone();
    }

    fn stats(&self) -> MiddlewareStats {
        self.stats.clone()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

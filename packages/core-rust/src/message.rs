//! Inbound message parsing.
//!
//! A delivery is reduced to three things before dispatch: the JSON payload,
//! the document-type discriminator and the correlation key. Headers win over
//! body fields so that producers can route without touching the payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::names::CorrelationKey;

/// Default header carrying the document-type discriminator.
pub const DEFAULT_DISCRIMINATOR_HEADER: &str = "x-document-type";
/// Default header carrying the correlation key.
pub const DEFAULT_CORRELATION_HEADER: &str = "x-correlation-id";
/// Default JSON body field carrying the discriminator.
pub const DEFAULT_DISCRIMINATOR_FIELD: &str = "documentType";
/// Default JSON body field carrying the correlation key.
pub const DEFAULT_CORRELATION_FIELD: &str = "correlationId";

/// Case-insensitive string headers of a delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryHeaders {
    entries: BTreeMap<String, String>,
}

impl DeliveryHeaders {
    /// Creates an empty header set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any previous value for the same name.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Inserts a header only if none is present under that name.
    pub fn insert_if_absent(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| value.into());
    }

    /// Looks up a header by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Iterates over `(name, value)` pairs with lower-cased names.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for DeliveryHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k.as_ref(), v);
        }
        headers
    }
}

/// Where the discriminator and correlation key are looked up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageFields {
    pub discriminator_header: String,
    pub correlation_header: String,
    pub discriminator_field: String,
    pub correlation_field: String,
}

impl Default for MessageFields {
    fn default() -> Self {
        Self {
            discriminator_header: DEFAULT_DISCRIMINATOR_HEADER.to_string(),
            correlation_header: DEFAULT_CORRELATION_HEADER.to_string(),
            discriminator_field: DEFAULT_DISCRIMINATOR_FIELD.to_string(),
            correlation_field: DEFAULT_CORRELATION_FIELD.to_string(),
        }
    }
}

/// Errors turning a delivery into an [`InboundMessage`].
///
/// Both are malformed input: redelivering the same bytes cannot fix them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("payload is not valid JSON: {0}")]
    PayloadParse(String),
    #[error("message carries no correlation key")]
    MissingCorrelationKey,
}

/// A parsed inbound message, ready for routing.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Document-type discriminator, if any was present.
    pub discriminator: Option<String>,
    /// Correlation key, used as the workflow instance id.
    pub correlation_key: CorrelationKey,
    /// Decoded JSON payload.
    pub payload: Value,
}

impl InboundMessage {
    /// Parses headers and raw payload bytes.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::PayloadParse` if the payload is not JSON and
    /// `MessageError::MissingCorrelationKey` if neither the header nor the
    /// body field yields a non-blank correlation key.
    pub fn parse(
        headers: &DeliveryHeaders,
        payload: &[u8],
        fields: &MessageFields,
    ) -> Result<Self, MessageError> {
        let payload: Value = serde_json::from_slice(payload)
            .map_err(|e| MessageError::PayloadParse(e.to_string()))?;

        let discriminator = headers
            .get(&fields.discriminator_header)
            .map(str::to_string)
            .or_else(|| body_string(&payload, &fields.discriminator_field))
            .filter(|d| !d.trim().is_empty());

        let correlation_key = headers
            .get(&fields.correlation_header)
            .map(str::to_string)
            .or_else(|| body_string(&payload, &fields.correlation_field))
            .map(|k| CorrelationKey::from(k.trim()))
            .filter(|k| !k.is_blank())
            .ok_or(MessageError::MissingCorrelationKey)?;

        Ok(Self {
            discriminator,
            correlation_key,
            payload,
        })
    }
}

/// Reads a top-level string (or number) field from a JSON object.
fn body_string(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

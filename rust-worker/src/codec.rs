//! Envelope codec: typed events to JSON bodies plus string attributes.

use std::collections::BTreeMap;

use crate::error::CodecError;
use crate::events::DomainEvent;

/// Attribute naming the producing context.
pub const ATTR_SCOPE: &str = "Scope";

/// Attribute naming the event type carried in the body.
pub const ATTR_EVENT_TYPE: &str = "EventType";

/// Attribute set on envelopes forwarded to a dead-letter queue.
pub const ATTR_DEAD_LETTER_REASON: &str = "DeadLetterReason";

/// Serialized event body plus flat routing attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub body: String,
    pub attributes: BTreeMap<String, String>,
}

/// Encodes events as JSON and stamps a fixed attribute set on each envelope.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec {
    attributes: BTreeMap<String, String>,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec that tags every envelope with `Scope=<scope>`.
    pub fn with_scope(scope: impl Into<String>) -> Self {
        Self::new().with_attribute(ATTR_SCOPE, scope)
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn encode<E: DomainEvent>(&self, event: &E) -> Result<Envelope, CodecError> {
        let body = serde_json::to_string(event).map_err(CodecError::EncodingFailed)?;

        let mut attributes = self.attributes.clone();
        attributes.insert(ATTR_EVENT_TYPE.to_string(), E::EVENT_TYPE.to_string());

        Ok(Envelope { body, attributes })
    }

    /// Decode a body back into a typed event. Attributes play no part.
    pub fn decode<E: DomainEvent>(&self, body: &str) -> Result<E, CodecError> {
        serde_json::from_str(body).map_err(CodecError::MalformedEnvelope)
    }
}

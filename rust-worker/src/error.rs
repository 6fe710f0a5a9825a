//! Error taxonomy for publishing and consuming domain events.
//!
//! Broker-level failures are reported as [`BrokerError`]; each component
//! (resolver, codec, publisher, consumer) wraps them into its own error type
//! so callers can tell a missing destination from a rejected message.

use std::time::Duration;

use thiserror::Error;

/// Failures reported by a broker transport.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached or the call failed in transit.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The queue handle no longer refers to an existing queue.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// The message body exceeds the broker's size limit.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The broker refused the message.
    #[error("message rejected by broker: {0}")]
    Rejected(String),

    /// The receipt token was already used or its visibility window expired.
    #[error("receipt token invalid or expired: {0}")]
    InvalidReceipt(String),
}

impl BrokerError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Envelope encoding and decoding failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode event: {0}")]
    EncodingFailed(#[source] serde_json::Error),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
}

/// Failures resolving a logical destination to a broker handle.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("logical destination name must not be empty")]
    InvalidName,

    #[error("resource '{name}' unavailable after {attempts} attempt(s): {source}")]
    ResourceUnavailable {
        name: String,
        attempts: u32,
        #[source]
        source: BrokerError,
    },
}

/// Failures publishing an event.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("destination '{destination}' unavailable: {reason}")]
    DestinationUnavailable { destination: String, reason: String },

    #[error(transparent)]
    EncodingFailed(#[from] CodecError),

    #[error("delivery to '{destination}' rejected: {source}")]
    DeliveryRejected {
        destination: String,
        #[source]
        source: BrokerError,
    },
}

impl From<ResolveError> for PublishError {
    fn from(err: ResolveError) -> Self {
        let destination = match &err {
            ResolveError::InvalidName => String::new(),
            ResolveError::ResourceUnavailable { name, .. } => name.clone(),
        };
        Self::DestinationUnavailable {
            destination,
            reason: err.to_string(),
        }
    }
}

/// A domain handler failed to process an event.
#[derive(Debug, Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(#[from] pub anyhow::Error);

impl HandlerError {
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self(anyhow::Error::msg(message))
    }
}

/// Failures that stop a consumer loop.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    ResourceUnavailable(#[from] ResolveError),

    #[error("consumer cancelled before polling started")]
    Cancelled,
}

/// Unrecoverable configuration problems detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Convenience for log fields.
pub(crate) fn millis(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(BrokerError::Unavailable("down".into()).is_transient());
        assert!(!BrokerError::Rejected("nope".into()).is_transient());
        assert!(!BrokerError::MessageTooLarge { size: 2, max: 1 }.is_transient());
        assert!(!BrokerError::InvalidReceipt("r".into()).is_transient());
    }

    #[test]
    fn test_resolve_error_maps_to_destination_unavailable() {
        let err: PublishError = ResolveError::ResourceUnavailable {
            name: "orders".into(),
            attempts: 3,
            source: BrokerError::Unavailable("timeout".into()),
        }
        .into();

        match err {
            PublishError::DestinationUnavailable { destination, reason } => {
                assert_eq!(destination, "orders");
                assert!(reason.contains("3 attempt"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

//! Event publisher.
//!
//! Publishing resolves the logical destination (creating it on first use),
//! encodes the event into an envelope and hands it to the broker. A publish
//! succeeds once the broker has accepted the message; consumers run later
//! and independently.

use std::sync::Arc;

use tracing::{error, info};

use crate::broker::{Broker, OutboundMessage, QueueHandle};
use crate::codec::EnvelopeCodec;
use crate::error::{BrokerError, PublishError};
use crate::events::DomainEvent;
use crate::resolver::ResourceResolver;

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub message_id: String,
    pub destination: QueueHandle,
    pub subject: String,
}

/// Publishes domain events to logical destinations.
///
/// Cheap to clone; clones share the broker client and the resolver cache.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    broker: Arc<dyn Broker>,
    resolver: Arc<ResourceResolver>,
    codec: EnvelopeCodec,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, resolver: Arc<ResourceResolver>, codec: EnvelopeCodec) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                broker,
                resolver,
                codec,
            }),
        }
    }

    /// Publish `event` to the destination named `destination`.
    pub async fn publish<E: DomainEvent>(
        &self,
        destination: &str,
        event: &E,
    ) -> Result<PublishResult, PublishError> {
        let handle = self.inner.resolver.resolve(destination).await?;

        let envelope = self.inner.codec.encode(event).map_err(|e| {
            error!(destination = destination, event_type = E::EVENT_TYPE, error = %e, "event_encode_failed");
            e
        })?;

        let subject = event.subject();
        let body_length = envelope.body.len();
        let message = OutboundMessage {
            body: envelope.body,
            subject: Some(subject.clone()),
            attributes: envelope.attributes,
        };

        let message_id = self
            .inner
            .broker
            .send(&handle, message)
            .await
            .map_err(|source| {
                error!(
                    destination = destination,
                    subject = %subject,
                    body_length = body_length,
                    error = %source,
                    "message_publish_failed"
                );
                match source {
                    BrokerError::Unavailable(reason) | BrokerError::QueueNotFound(reason) => {
                        PublishError::DestinationUnavailable {
                            destination: destination.to_string(),
                            reason,
                        }
                    }
                    source => PublishError::DeliveryRejected {
                        destination: destination.to_string(),
                        source,
                    },
                }
            })?;

        info!(
            destination = destination,
            url = %handle,
            message_id = %message_id,
            subject = %subject,
            event_type = E::EVENT_TYPE,
            body_length = body_length,
            "message_published"
        );

        Ok(PublishResult {
            message_id,
            destination: handle,
            subject,
        })
    }
}

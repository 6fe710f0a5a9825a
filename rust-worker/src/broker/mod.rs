//! Broker abstraction used by the resolver, publisher and consumer.
//!
//! A [`Broker`] exposes the five calls the messaging core needs:
//!
//! ```text
//! find_queue / create_queue   (provisioning, keyed by logical name)
//! send                        (publisher egress)
//! receive / delete            (consumer ingress and acknowledgment)
//! ```
//!
//! Implementations must be safe for concurrent use; components share one
//! client behind an `Arc<dyn Broker>`.

pub mod amqp;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;

pub use amqp::AmqpBroker;
pub use memory::{InMemoryBroker, MemoryBrokerConfig};

/// Broker-assigned handle for a resolved queue or topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    name: String,
    url: String,
}

impl QueueHandle {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// Logical name the handle was resolved from.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Outcome of looking a queue up by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(QueueHandle),
    NotFound,
}

/// Opaque per-delivery token required to acknowledge a received message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptToken(String);

impl ReceiptToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to the broker for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: String,
    pub subject: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

/// A message delivered by the broker, with the token needed to delete it.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    pub subject: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub receipt: ReceiptToken,
    /// How many times this message has been received, when the broker knows.
    pub receive_count: Option<u32>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Look up an existing queue by logical name.
    async fn find_queue(&self, name: &str) -> Result<Lookup, BrokerError>;

    /// Create a queue. Creating an existing queue returns its handle.
    async fn create_queue(&self, name: &str) -> Result<QueueHandle, BrokerError>;

    /// Hand a message to the broker; returns the broker-assigned message id
    /// once the broker has accepted it.
    async fn send(&self, queue: &QueueHandle, message: OutboundMessage)
        -> Result<String, BrokerError>;

    /// Receive up to `max_messages`, waiting up to `wait` for at least one.
    async fn receive(
        &self,
        queue: &QueueHandle,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BrokerError>;

    /// Acknowledge a delivery, removing the message from the queue.
    async fn delete(&self, queue: &QueueHandle, receipt: &ReceiptToken) -> Result<(), BrokerError>;
}

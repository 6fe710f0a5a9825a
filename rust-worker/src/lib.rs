//! Herald - reliable domain-event publishing and consumption.
//!
//! This library provides the messaging core shared by the two binaries:
//! - `herald-web`: Thin HTTP producer that publishes domain events
//! - `herald-consumer`: Queue watcher that processes and acknowledges them
//!
//! ## Architecture
//!
//! ```text
//! Producer: Publisher → ResourceResolver → EnvelopeCodec → Broker::send
//! Consumer: ResourceResolver → Broker::receive → decode → handler → Broker::delete
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod publisher;
pub mod resolver;
pub mod web;

// Re-export commonly used types
pub use broker::{AmqpBroker, Broker, InMemoryBroker, MemoryBrokerConfig, QueueHandle};
pub use codec::{Envelope, EnvelopeCodec};
pub use config::Config;
pub use consumer::{Consumer, ConsumerOptions, ConsumerState, DeliveryInfo, EventHandler};
pub use error::{
    BrokerError, CodecError, ConfigError, ConsumerError, HandlerError, PublishError, ResolveError,
};
pub use events::{
    DomainEvent, OrderCreatedNotification, ProductDetail, UserRegisteredEvent,
    ORDER_CREATED_TOPIC, USER_REGISTERED_QUEUE,
};
pub use publisher::{PublishResult, Publisher};
pub use resolver::{Resolution, ResourceResolver, RetryPolicy};
pub use web::AppState;

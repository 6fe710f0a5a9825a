//! Domain events exchanged between producers and consumers.
//!
//! Field names are serialized in PascalCase so the bodies match what the
//! existing .NET services put on the wire.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Logical name of the topic order notifications are published to.
pub const ORDER_CREATED_TOPIC: &str = "OrderCreated";

/// Logical name of the queue user registrations are published to.
pub const USER_REGISTERED_QUEUE: &str = "user-registered";

/// Capabilities shared by every event that travels through the broker.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type name, carried in the `EventType` attribute.
    const EVENT_TYPE: &'static str;

    /// Unique identity of the event's subject.
    fn id(&self) -> String;

    /// When the event was constructed by the producer.
    fn created_at(&self) -> DateTime<Utc>;

    /// Transport-level subject/label, e.g. `Order#42`.
    fn subject(&self) -> String;
}

// =============================================================================
// Orders
// =============================================================================

/// A single product line on an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProductDetail {
    pub product_id: i64,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
}

/// Published after an order has been accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderCreatedNotification {
    order_id: i64,
    customer_id: i64,
    created_at: DateTime<Utc>,
    product_details: Vec<ProductDetail>,
}

impl OrderCreatedNotification {
    pub fn new(order_id: i64, customer_id: i64, product_details: Vec<ProductDetail>) -> Self {
        Self {
            order_id,
            customer_id,
            created_at: Utc::now(),
            product_details,
        }
    }

    pub fn order_id(&self) -> i64 {
        self.order_id
    }

    pub fn customer_id(&self) -> i64 {
        self.customer_id
    }

    pub fn product_details(&self) -> &[ProductDetail] {
        &self.product_details
    }
}

impl DomainEvent for OrderCreatedNotification {
    const EVENT_TYPE: &'static str = "OrderCreatedNotification";

    fn id(&self) -> String {
        self.order_id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn subject(&self) -> String {
        format!("Order#{}", self.order_id)
    }
}

// =============================================================================
// Users
// =============================================================================

/// Published after a user has registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserRegisteredEvent {
    user_id: Uuid,
    user_name: String,
    email: String,
    created_date: DateTime<Utc>,
}

impl UserRegisteredEvent {
    pub fn new(user_id: Uuid, user_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
            email: email.into(),
            created_date: Utc::now(),
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn email(&self) -> &str {
        &self.email
    }
}

impl DomainEvent for UserRegisteredEvent {
    const EVENT_TYPE: &'static str = "UserRegisteredEvent";

    fn id(&self) -> String {
        self.user_id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_date
    }

    fn subject(&self) -> String {
        format!("User#{}", self.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_subject_uses_order_id() {
        let order = OrderCreatedNotification::new(42, 7, vec![]);
        assert_eq!(order.subject(), "Order#42");
        assert_eq!(order.id(), "42");
    }

    #[test]
    fn test_creation_time_is_assigned_at_construction() {
        let before = Utc::now();
        let event = UserRegisteredEvent::new(Uuid::new_v4(), "alice", "a@x.com");
        let after = Utc::now();

        assert!(event.created_at() >= before && event.created_at() <= after);
    }

    #[test]
    fn test_user_event_serializes_pascal_case() {
        let id = Uuid::new_v4();
        let event = UserRegisteredEvent::new(id, "alice", "a@x.com");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["UserId"], id.to_string());
        assert_eq!(json["UserName"], "alice");
        assert_eq!(json["Email"], "a@x.com");
        assert!(json.get("CreatedDate").is_some());
    }
}

//! Producer endpoint handlers.
//!
//! These handlers only:
//! 1. Validate the request
//! 2. Build the domain event
//! 3. Publish it and report the outcome

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PublishError;
use crate::events::{
    OrderCreatedNotification, ProductDetail, UserRegisteredEvent, ORDER_CREATED_TOPIC,
    USER_REGISTERED_QUEUE,
};
use crate::publisher::Publisher;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Publisher,
}

impl AppState {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Response for publishing endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PublishResponse {
    fn rejected(status: &str, error: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            id: None,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

fn publish_failure(err: &PublishError) -> (StatusCode, Json<PublishResponse>) {
    let status = match err {
        PublishError::DeliveryRejected { .. } => StatusCode::BAD_GATEWAY,
        PublishError::DestinationUnavailable { .. } | PublishError::EncodingFailed(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (status, Json(PublishResponse::rejected("error", err.to_string())))
}

// =============================================================================
// User Registration
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUserRequest {
    pub user_name: String,
    pub email: String,
}

impl RegisterUserRequest {
    fn validate(&self) -> Result<(), &'static str> {
        if self.user_name.trim().is_empty() {
            return Err("userName is required");
        }
        let email = self.email.trim();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
            _ => Err("email must be a valid address"),
        }
    }
}

/// Register a user and publish `UserRegisteredEvent` to `user-registered`.
pub async fn register_user(
    State(state): State<AppState>,
    Json(request): Json<RegisterUserRequest>,
) -> impl IntoResponse {
    if let Err(reason) = request.validate() {
        warn!(reason = reason, "register_request_invalid");
        return (
            StatusCode::BAD_REQUEST,
            Json(PublishResponse::rejected("invalid", reason)),
        );
    }

    let user_id = Uuid::new_v4();
    let event = UserRegisteredEvent::new(user_id, request.user_name.trim(), request.email.trim());

    match state.publisher.publish(USER_REGISTERED_QUEUE, &event).await {
        Ok(result) => {
            info!(user_id = %user_id, message_id = %result.message_id, "user_registered_published");
            (
                StatusCode::OK,
                Json(PublishResponse {
                    status: "published".to_string(),
                    id: Some(user_id.to_string()),
                    message_id: Some(result.message_id),
                    error: None,
                }),
            )
        }
        Err(e) => {
            error!(user_id = %user_id, error = %e, "user_registered_publish_failed");
            publish_failure(&e)
        }
    }
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDetailRequest {
    pub product_id: i64,
    #[serde(default)]
    pub name: String,
    pub quantity: u32,
    #[serde(default)]
    pub unit_price_cents: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub order_id: i64,
    pub customer_id: i64,
    #[serde(default)]
    pub product_details: Vec<ProductDetailRequest>,
}

impl CreateOrderRequest {
    fn validate(&self) -> Result<(), &'static str> {
        if self.order_id <= 0 {
            return Err("orderId must be positive");
        }
        if self.customer_id <= 0 {
            return Err("customerId must be positive");
        }
        if self.product_details.iter().any(|p| p.product_id <= 0) {
            return Err("productId must be positive");
        }
        Ok(())
    }
}

/// Accept an order and publish `OrderCreatedNotification` to `OrderCreated`.
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> impl IntoResponse {
    if let Err(reason) = request.validate() {
        warn!(order_id = request.order_id, reason = reason, "order_request_invalid");
        return (
            StatusCode::BAD_REQUEST,
            Json(PublishResponse::rejected("invalid", reason)),
        );
    }

    let lines = request
        .product_details
        .into_iter()
        .map(|p| ProductDetail {
            product_id: p.product_id,
            name: p.name,
            quantity: p.quantity,
            unit_price_cents: p.unit_price_cents,
        })
        .collect();
    let notification = OrderCreatedNotification::new(request.order_id, request.customer_id, lines);

    match state.publisher.publish(ORDER_CREATED_TOPIC, &notification).await {
        Ok(result) => {
            info!(
                order_id = request.order_id,
                subject = %result.subject,
                message_id = %result.message_id,
                "order_created_published"
            );
            (
                StatusCode::OK,
                Json(PublishResponse {
                    status: "published".to_string(),
                    id: Some(request.order_id.to_string()),
                    message_id: Some(result.message_id),
                    error: None,
                }),
            )
        }
        Err(e) => {
            error!(order_id = request.order_id, error = %e, "order_created_publish_failed");
            publish_failure(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::broker::{Broker, InMemoryBroker, MemoryBrokerConfig};
    use crate::codec::EnvelopeCodec;
    use crate::resolver::{ResourceResolver, RetryPolicy};
    use crate::web::router;

    fn state_for(broker: &InMemoryBroker) -> AppState {
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());
        let resolver = Arc::new(ResourceResolver::new(
            Arc::clone(&shared),
            RetryPolicy {
                max_attempts: Some(1),
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
        ));
        let publisher = Publisher::new(shared, resolver, EnvelopeCodec::with_scope("Lambda"));
        AppState::new(publisher)
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read(response: axum::response::Response) -> PublishResponse {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(state_for(&InMemoryBroker::default()));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_register_publishes_event() {
        let broker = InMemoryBroker::default();
        let app = router(state_for(&broker));

        let response = app
            .oneshot(post(
                "/register",
                serde_json::json!({"userName": "alice", "email": "a@x.com"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = read(response).await;
        assert_eq!(body.status, "published");

        let bodies = broker.bodies(USER_REGISTERED_QUEUE);
        assert_eq!(bodies.len(), 1);
        let event: UserRegisteredEvent = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(event.user_name(), "alice");
        assert_eq!(event.user_id().to_string(), body.id.unwrap());
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_email() {
        let broker = InMemoryBroker::default();
        let app = router(state_for(&broker));

        let response = app
            .oneshot(post(
                "/register",
                serde_json::json!({"userName": "alice", "email": "nope"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_order_publishes_with_subject() {
        let broker = InMemoryBroker::default();
        let app = router(state_for(&broker));

        let response = app
            .oneshot(post(
                "/orders",
                serde_json::json!({
                    "orderId": 42,
                    "customerId": 7,
                    "productDetails": [{"productId": 1, "name": "Mouse", "quantity": 2, "unitPriceCents": 1999}]
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let queue = broker.find_queue(ORDER_CREATED_TOPIC).await.unwrap();
        let crate::broker::Lookup::Found(queue) = queue else {
            panic!("order topic was not created");
        };
        let received = broker.receive(&queue, 1, Duration::ZERO).await.unwrap();
        assert_eq!(received[0].subject.as_deref(), Some("Order#42"));
    }

    #[tokio::test]
    async fn test_order_rejects_non_positive_ids() {
        let app = router(state_for(&InMemoryBroker::default()));

        let response = app
            .oneshot(post(
                "/orders",
                serde_json::json!({"orderId": 0, "customerId": 7}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_registration_maps_to_bad_gateway() {
        let broker = InMemoryBroker::new(MemoryBrokerConfig {
            max_message_bytes: 64,
            ..Default::default()
        });
        let app = router(state_for(&broker));

        let response = app
            .oneshot(post(
                "/register",
                serde_json::json!({"userName": "a".repeat(200), "email": "a@x.com"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(read(response).await.status, "error");
    }

    #[tokio::test]
    async fn test_broker_outage_maps_to_service_unavailable() {
        let broker = InMemoryBroker::default();
        broker.set_available(false);
        let app = router(state_for(&broker));

        let response = app
            .oneshot(post(
                "/register",
                serde_json::json!({"userName": "alice", "email": "a@x.com"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

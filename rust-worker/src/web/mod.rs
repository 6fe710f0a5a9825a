//! Thin HTTP boundary in front of the publisher.
//!
//! Handlers validate the request, build the domain event and publish it.
//! Everything interesting happens in [`crate::publisher`].

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    create_order, health, register_user, AppState, CreateOrderRequest, HealthResponse,
    PublishResponse, RegisterUserRequest,
};

/// Build the producer router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/register", post(register_user))
        .route("/orders", post(create_order))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

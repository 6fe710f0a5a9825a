//! Herald Web Server - thin producer boundary.
//!
//! This binary provides a small HTTP server that:
//! - Accepts user registrations and orders
//! - Validates the request
//! - Publishes the matching domain event and reports the outcome
//!
//! Queues and topics are created on first publish.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use herald::web::router;
use herald::{AmqpBroker, AppState, Broker, Config, EnvelopeCodec, Publisher, ResourceResolver};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env();
    config.validate().context("Invalid configuration")?;
    info!(
        port = config.port,
        scope = %config.publish_scope,
        max_message_bytes = config.max_message_bytes,
        "config_loaded"
    );

    // Broker client shared by every request
    let amqp = AmqpBroker::new(
        config.amqp_url.clone(),
        config.max_message_bytes,
        config.visibility_timeout(),
    );
    let broker: Arc<dyn Broker> = Arc::new(amqp.clone());
    let resolver = Arc::new(ResourceResolver::new(
        Arc::clone(&broker),
        config.retry_policy(),
    ));
    let publisher = Publisher::new(
        broker,
        resolver,
        EnvelopeCodec::with_scope(config.publish_scope.clone()),
    );
    info!("publisher_created");

    let state = AppState::new(publisher);
    let app = router(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Close broker connection
    amqp.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}

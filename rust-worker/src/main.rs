//! Herald Consumer - at-least-once queue watcher for user registrations.
//!
//! Resolves the configured queue (creating it if needed), long-polls it for
//! batches of `UserRegisteredEvent` envelopes, and deletes each envelope only
//! after its handler succeeded.

mod handler;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use herald::{AmqpBroker, Broker, Config, Consumer, ConsumerError, ResourceResolver};

use crate::handler::UserRegisteredLogger;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("consumer_starting");

    // Load configuration from environment
    let config = Config::from_env();
    config.validate().context("Invalid configuration")?;
    info!(
        amqp_url_set = !config.amqp_url.is_empty(),
        queue = %config.consumer_queue,
        batch_size = config.receive_batch_size,
        wait_ms = config.receive_wait_ms,
        concurrency = config.processing_concurrency,
        dead_letter_queue = ?config.dead_letter_queue,
        "config_loaded"
    );

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
    let handler = Arc::new(UserRegisteredLogger {
        processing_delay: Duration::from_millis(config.processing_delay_ms),
    });

    let consumer = Consumer::new(
        config.consumer_queue.clone(),
        broker,
        resolver,
        handler,
        config.consumer_options(),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let result = consumer.run(cancel).await;
    amqp.close().await;

    match result {
        Ok(summary) => {
            info!(
                received = summary.received,
                acknowledged = summary.acknowledged,
                "consumer_shutdown_complete"
            );
            Ok(())
        }
        Err(ConsumerError::Cancelled) => {
            info!("consumer_cancelled_before_ready");
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context("Consumer failed")),
    }
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

    info!("consumer_stopping");
}

//! Demo handler for user registrations.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::info;

use herald::{DeliveryInfo, DomainEvent, EventHandler, HandlerError, UserRegisteredEvent};

/// Logs each registration and pauses to stand in for real work.
pub struct UserRegisteredLogger {
    pub processing_delay: Duration,
}

#[async_trait]
impl EventHandler for UserRegisteredLogger {
    type Event = UserRegisteredEvent;

    async fn handle(
        &self,
        event: UserRegisteredEvent,
        delivery: &DeliveryInfo,
    ) -> Result<(), HandlerError> {
        info!(
            message_id = %delivery.message_id,
            user_id = %event.user_id(),
            user_name = %event.user_name(),
            email = %event.email(),
            created_at = %event.created_at(),
            receive_count = ?delivery.receive_count,
            "user_registered_received"
        );

        sleep(self.processing_delay).await;
        Ok(())
    }
}

//! Poll-process-acknowledge consumer loop.
//!
//! A [`Consumer`] watches one queue:
//!
//! ```text
//! Idle → Resolving → Polling → Processing(n) → Acknowledging → Polling …
//!                        ↘ (cancelled) Stopping → Terminated
//! ```
//!
//! An envelope is deleted only after its handler returned success. Failed
//! envelopes are left alone so the broker redelivers them once their
//! visibility window elapses. Cancellation is checked between poll cycles;
//! handlers are never interrupted, and envelopes that already succeeded are
//! always acknowledged before the loop stops.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, OutboundMessage, QueueHandle, ReceivedMessage};
use crate::codec::{EnvelopeCodec, ATTR_DEAD_LETTER_REASON};
use crate::error::{millis, ConsumerError, HandlerError};
use crate::events::DomainEvent;
use crate::resolver::ResourceResolver;

/// Delivery metadata passed to handlers alongside the decoded event.
#[derive(Debug, Clone)]
pub struct DeliveryInfo {
    pub message_id: String,
    pub subject: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub receive_count: Option<u32>,
}

/// Domain-specific processing of one decoded event.
///
/// Handlers must tolerate duplicates: a delivery whose acknowledgment is lost
/// is processed again.
#[async_trait]
pub trait EventHandler: Send + Sync {
    type Event: DomainEvent;

    async fn handle(&self, event: Self::Event, delivery: &DeliveryInfo)
        -> Result<(), HandlerError>;
}

/// Where the consumer loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Resolving,
    Polling,
    Processing(usize),
    Acknowledging,
    Stopping,
    Terminated,
}

/// Consumer tunables.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Maximum envelopes requested per receive call.
    pub batch_size: usize,
    /// How long a receive may block waiting for envelopes.
    pub wait: Duration,
    /// Envelopes of one batch processed at the same time.
    pub concurrency: usize,
    /// Queue that malformed and exhausted envelopes are forwarded to.
    pub dead_letter_queue: Option<String>,
    /// Dead-letter a failing envelope once it has been received this often.
    pub max_deliveries: Option<u32>,
    /// Pause after a failed receive call before polling again.
    pub error_backoff: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            wait: Duration::from_secs(20),
            concurrency: 1,
            dead_letter_queue: None,
            max_deliveries: None,
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Totals over the lifetime of a consumer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub polls: u64,
    pub received: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub malformed: u64,
    pub dead_lettered: u64,
}

#[derive(Debug)]
enum Outcome {
    Succeeded,
    Failed,
    Malformed,
    DeadLetter(String),
}

/// Long-running watcher for a single queue.
pub struct Consumer<H> {
    queue_name: String,
    broker: Arc<dyn Broker>,
    resolver: Arc<ResourceResolver>,
    handler: Arc<H>,
    codec: EnvelopeCodec,
    options: ConsumerOptions,
    state: watch::Sender<ConsumerState>,
}

impl<H> Consumer<H>
where
    H: EventHandler + 'static,
{
    pub fn new(
        queue_name: impl Into<String>,
        broker: Arc<dyn Broker>,
        resolver: Arc<ResourceResolver>,
        handler: Arc<H>,
        options: ConsumerOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            queue_name: queue_name.into(),
            broker,
            resolver,
            handler,
            codec: EnvelopeCodec::new(),
            options,
            state,
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ConsumerState) {
        self.state.send_replace(next);
        debug!(queue = %self.queue_name, state = ?next, "consumer_state");
    }

    /// Run until `cancel` fires.
    ///
    /// Returns [`ConsumerError::Cancelled`] if cancelled before the source
    /// queue was resolved, and [`ConsumerError::ResourceUnavailable`] if the
    /// queue could not be resolved within the retry budget.
    pub async fn run(self, cancel: CancellationToken) -> Result<ConsumerSummary, ConsumerError> {
        info!(queue = %self.queue_name, "consumer_starting");
        self.transition(ConsumerState::Resolving);

        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConsumerError::Cancelled),
            resolved = self.resolve_queues() => resolved,
        };

        let (queue, dead_letter) = match resolved {
            Ok(queues) => queues,
            Err(e) => {
                warn!(queue = %self.queue_name, error = %e, "consumer_resolve_aborted");
                self.transition(ConsumerState::Terminated);
                return Err(e);
            }
        };

        info!(
            queue = %self.queue_name,
            url = %queue,
            batch_size = self.options.batch_size,
            wait_ms = millis(self.options.wait),
            concurrency = self.options.concurrency,
            dead_letter_queue = ?self.options.dead_letter_queue,
            "consumer_ready"
        );

        let mut summary = ConsumerSummary::default();

        while !cancel.is_cancelled() {
            self.transition(ConsumerState::Polling);

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = self.broker.receive(&queue, self.options.batch_size, self.options.wait) => received,
            };
            summary.polls += 1;

            let batch = match received {
                Ok(batch) => batch,
                Err(e) => {
                    error!(queue = %self.queue_name, error = %e, "consumer_receive_failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.options.error_backoff) => continue,
                    }
                }
            };

            if batch.is_empty() {
                debug!(queue = %self.queue_name, "consumer_poll_empty");
                continue;
            }

            summary.received += batch.len() as u64;
            self.transition(ConsumerState::Processing(batch.len()));
            let outcomes = self.process_batch(batch).await;

            self.transition(ConsumerState::Acknowledging);
            let before = summary;
            self.acknowledge(&queue, dead_letter.as_ref(), outcomes, &mut summary)
                .await;
            info!(
                queue = %self.queue_name,
                acknowledged = summary.acknowledged - before.acknowledged,
                failed = summary.failed - before.failed,
                malformed = summary.malformed - before.malformed,
                dead_lettered = summary.dead_lettered - before.dead_lettered,
                "consumer_batch_complete"
            );
        }

        self.transition(ConsumerState::Stopping);
        info!(
            queue = %self.queue_name,
            polls = summary.polls,
            received = summary.received,
            acknowledged = summary.acknowledged,
            failed = summary.failed,
            malformed = summary.malformed,
            dead_lettered = summary.dead_lettered,
            "consumer_stopped"
        );
        self.transition(ConsumerState::Terminated);

        Ok(summary)
    }

    async fn resolve_queues(&self) -> Result<(QueueHandle, Option<QueueHandle>), ConsumerError> {
        info!(queue = %self.queue_name, "consumer_resolving_queue");
        let queue = self.resolver.resolve(&self.queue_name).await?;

        let dead_letter = match &self.options.dead_letter_queue {
            Some(name) => Some(self.resolver.resolve(name).await?),
            None => None,
        };

        Ok((queue, dead_letter))
    }

    async fn process_batch(&self, batch: Vec<ReceivedMessage>) -> Vec<(ReceivedMessage, Outcome)> {
        let concurrency = self.options.concurrency.max(1);

        stream::iter(batch)
            .map(|message| async move {
                let outcome = self.process_one(&message).await;
                (message, outcome)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    async fn process_one(&self, message: &ReceivedMessage) -> Outcome {
        let event: H::Event = match self.codec.decode(&message.body) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    queue = %self.queue_name,
                    message_id = %message.message_id,
                    error = %e,
                    body_preview = %message.body.chars().take(200).collect::<String>(),
                    "consumer_envelope_malformed"
                );
                return if self.options.dead_letter_queue.is_some() {
                    Outcome::DeadLetter(e.to_string())
                } else {
                    Outcome::Malformed
                };
            }
        };

        let delivery = DeliveryInfo {
            message_id: message.message_id.clone(),
            subject: message.subject.clone(),
            attributes: message.attributes.clone(),
            receive_count: message.receive_count,
        };

        debug!(
            queue = %self.queue_name,
            message_id = %message.message_id,
            event_id = %event.id(),
            "consumer_handler_start"
        );

        match self.handler.handle(event, &delivery).await {
            Ok(()) => Outcome::Succeeded,
            Err(e) => {
                warn!(
                    queue = %self.queue_name,
                    message_id = %message.message_id,
                    receive_count = ?message.receive_count,
                    error = %e,
                    "consumer_handler_failed"
                );
                if self.deliveries_exhausted(message) {
                    Outcome::DeadLetter(e.to_string())
                } else {
                    Outcome::Failed
                }
            }
        }
    }

    fn deliveries_exhausted(&self, message: &ReceivedMessage) -> bool {
        if self.options.dead_letter_queue.is_none() {
            return false;
        }
        match (self.options.max_deliveries, message.receive_count) {
            (Some(max), Some(count)) => count >= max,
            _ => false,
        }
    }

    async fn acknowledge(
        &self,
        queue: &QueueHandle,
        dead_letter: Option<&QueueHandle>,
        outcomes: Vec<(ReceivedMessage, Outcome)>,
        summary: &mut ConsumerSummary,
    ) {
        for (message, outcome) in outcomes {
            match outcome {
                Outcome::Succeeded => {
                    if self.delete(queue, &message).await {
                        summary.acknowledged += 1;
                    }
                }
                Outcome::Failed => summary.failed += 1,
                Outcome::Malformed => summary.malformed += 1,
                Outcome::DeadLetter(reason) => {
                    let Some(dead_letter) = dead_letter else {
                        summary.failed += 1;
                        continue;
                    };
                    if self.forward(dead_letter, &message, reason).await
                        && self.delete(queue, &message).await
                    {
                        summary.dead_lettered += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
            }
        }
    }

    async fn delete(&self, queue: &QueueHandle, message: &ReceivedMessage) -> bool {
        match self.broker.delete(queue, &message.receipt).await {
            Ok(()) => {
                info!(
                    queue = %self.queue_name,
                    message_id = %message.message_id,
                    "consumer_message_acknowledged"
                );
                true
            }
            Err(e) => {
                error!(
                    queue = %self.queue_name,
                    message_id = %message.message_id,
                    error = %e,
                    "consumer_ack_failed"
                );
                false
            }
        }
    }

    async fn forward(&self, dead_letter: &QueueHandle, message: &ReceivedMessage, reason: String) -> bool {
        let mut attributes = message.attributes.clone();
        attributes.insert(ATTR_DEAD_LETTER_REASON.to_string(), reason);

        let forwarded = OutboundMessage {
            body: message.body.clone(),
            subject: message.subject.clone(),
            attributes,
        };

        match self.broker.send(dead_letter, forwarded).await {
            Ok(id) => {
                warn!(
                    queue = %self.queue_name,
                    message_id = %message.message_id,
                    dead_letter_queue = dead_letter.name(),
                    dead_letter_id = %id,
                    "consumer_message_dead_lettered"
                );
                true
            }
            Err(e) => {
                error!(
                    queue = %self.queue_name,
                    message_id = %message.message_id,
                    error = %e,
                    "consumer_dead_letter_failed"
                );
                false
            }
        }
    }
}

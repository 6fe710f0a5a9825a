//! RabbitMQ broker using lapin.
//!
//! The queue contract maps onto AMQP as follows:
//!
//! ```text
//! find_queue   → passive queue.declare on a throwaway channel (404 = not found)
//! create_queue → durable queue.declare (idempotent)
//! send         → basic.publish with publisher confirms (nack = rejected)
//! receive      → basic.get until the batch is full or the wait window ends
//! delete       → basic.ack by delivery tag
//! ```
//!
//! RabbitMQ has no per-message visibility timeout, so the broker keeps its
//! own ledger of unacknowledged deliveries. Any delivery still outstanding
//! once the visibility window has passed is nacked with `requeue` on the next
//! receive, and its receipt stops being accepted.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Broker, Lookup, OutboundMessage, QueueHandle, ReceiptToken, ReceivedMessage};
use crate::error::BrokerError;

/// Header carrying the transport subject; stripped from received attributes.
const SUBJECT_HEADER: &str = "x-subject";

/// Header set by quorum queues: how many times the message was returned.
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// How often an empty queue is re-polled while a receive is waiting.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// RabbitMQ-backed broker with lazy connection management.
///
/// The broker keeps one connection and one confirm-mode channel, reconnecting
/// on failure. Every channel gets a new generation number which is embedded
/// in receipts, so a receipt issued before a reconnect is rejected instead of
/// acknowledging whatever delivery now carries the same tag.
#[derive(Clone)]
pub struct AmqpBroker {
    inner: Arc<AmqpInner>,
}

struct AmqpInner {
    url: String,
    max_message_bytes: usize,
    visibility_timeout: Duration,
    poll_interval: Duration,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<ActiveChannel>>,
    generations: AtomicU64,
    in_flight: Mutex<InFlight>,
}

/// The confirm-mode channel together with its generation.
#[derive(Clone)]
struct ActiveChannel {
    channel: Channel,
    generation: u64,
}

#[derive(Debug)]
struct Outstanding {
    received_at: Instant,
    message_id: Option<String>,
}

/// Unacknowledged deliveries of the current channel generation, plus how
/// often each message id has been received by this process.
#[derive(Debug, Default)]
struct InFlight {
    generation: u64,
    deliveries: HashMap<u64, Outstanding>,
    receive_counts: HashMap<String, u32>,
}

impl InFlight {
    /// Forget deliveries of older channels; RabbitMQ requeued them when the
    /// channel went away.
    fn sync(&mut self, generation: u64) {
        if generation > self.generation {
            self.generation = generation;
            self.deliveries.clear();
        }
    }

    /// Record a delivery and return how many times its message has now been
    /// received. Returns `None` for deliveries of a superseded channel.
    fn track(
        &mut self,
        generation: u64,
        tag: u64,
        message_id: Option<&str>,
        now: Instant,
    ) -> Option<u32> {
        self.sync(generation);
        if generation != self.generation {
            return None;
        }

        let count = match message_id {
            Some(id) => {
                let count = self.receive_counts.entry(id.to_string()).or_insert(0);
                *count += 1;
                *count
            }
            None => 1,
        };

        self.deliveries.insert(
            tag,
            Outstanding {
                received_at: now,
                message_id: message_id.map(str::to_string),
            },
        );
        Some(count)
    }

    /// Take every delivery whose visibility window has passed.
    fn expire(&mut self, generation: u64, now: Instant, window: Duration) -> Vec<u64> {
        self.sync(generation);
        if generation != self.generation {
            return Vec::new();
        }

        let mut expired: Vec<u64> = self
            .deliveries
            .iter()
            .filter(|(_, d)| now.saturating_duration_since(d.received_at) >= window)
            .map(|(tag, _)| *tag)
            .collect();
        expired.sort_unstable();

        for tag in &expired {
            self.deliveries.remove(tag);
        }
        expired
    }

    /// Claim a delivery for acknowledgment. Fails for unknown, expired or
    /// already settled deliveries and for receipts of another channel.
    fn settle(&mut self, generation: u64, tag: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        match self.deliveries.remove(&tag) {
            Some(delivery) => {
                if let Some(id) = delivery.message_id {
                    self.receive_counts.remove(&id);
                }
                true
            }
            None => false,
        }
    }
}

fn receipt_for(generation: u64, tag: u64) -> ReceiptToken {
    ReceiptToken::new(format!("{generation}:{tag}"))
}

fn parse_receipt(receipt: &ReceiptToken) -> Option<(u64, u64)> {
    let (generation, tag) = receipt.as_str().split_once(':')?;
    Some((generation.parse().ok()?, tag.parse().ok()?))
}

/// Receive count from the quorum-queue header, which counts earlier returns.
fn header_receive_count(headers: Option<&FieldTable>) -> Option<u32> {
    let (_, value) = headers?
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)?;
    let returned: u64 = match value {
        AMQPValue::LongLongInt(v) => u64::try_from(*v).ok()?,
        AMQPValue::LongInt(v) => u64::try_from(*v).ok()?,
        AMQPValue::LongUInt(v) => u64::from(*v),
        AMQPValue::ShortInt(v) => u64::try_from(*v).ok()?,
        AMQPValue::ShortUInt(v) => u64::from(*v),
        _ => return None,
    };
    u32::try_from(returned.saturating_add(1)).ok()
}

fn unavailable(context: &str, err: lapin::Error) -> BrokerError {
    BrokerError::Unavailable(format!("{context}: {err}"))
}

impl AmqpBroker {
    /// Create a broker for the given AMQP URL. No connection is made until
    /// the first call.
    pub fn new(url: String, max_message_bytes: usize, visibility_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(AmqpInner {
                url,
                max_message_bytes,
                visibility_timeout,
                poll_interval: DEFAULT_POLL_INTERVAL,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
                generations: AtomicU64::new(0),
                in_flight: Mutex::new(InFlight::default()),
            }),
        }
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<ActiveChannel, BrokerError> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(active) = channel.as_ref() {
                if active.channel.status().connected() {
                    return Ok(active.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(active) = channel.as_ref() {
            if active.channel.status().connected() {
                return Ok(active.clone());
            }
        }

        let conn_usable = connection
            .as_ref()
            .map(|c| c.status().connected())
            .unwrap_or(false);

        if !conn_usable {
            info!(url_length = self.inner.url.len(), "rabbitmq_connecting");
            let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
                .await
                .map_err(|e| unavailable("failed to connect to RabbitMQ", e))?;
            info!("rabbitmq_connected");
            *connection = Some(conn);
        }

        let conn = connection
            .as_ref()
            .ok_or_else(|| BrokerError::Unavailable("connection missing".to_string()))?;

        let ch = conn
            .create_channel()
            .await
            .map_err(|e| unavailable("failed to create channel", e))?;

        ch.confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| unavailable("failed to enable publisher confirms", e))?;

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        info!(generation = generation, "rabbitmq_channel_created");

        let active = ActiveChannel {
            channel: ch,
            generation,
        };
        *channel = Some(active.clone());
        Ok(active)
    }

    /// A short-lived channel for calls that may close it (passive declare).
    async fn scratch_channel(&self) -> Result<Channel, BrokerError> {
        self.ensure_connected().await?;

        let connection = self.inner.connection.read().await;
        let conn = connection
            .as_ref()
            .ok_or_else(|| BrokerError::Unavailable("connection missing".to_string()))?;

        conn.create_channel()
            .await
            .map_err(|e| unavailable("failed to create channel", e))
    }

    fn handle_for(name: &str) -> QueueHandle {
        QueueHandle::new(name, format!("amqp:///{name}"))
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(active) = channel.take() {
            if let Err(e) = active.channel.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_broker_closed");
    }

    /// Return deliveries whose visibility window has passed to their queue.
    async fn requeue_expired(&self, active: &ActiveChannel) -> Result<(), BrokerError> {
        let expired = self.inner.in_flight.lock().await.expire(
            active.generation,
            Instant::now(),
            self.inner.visibility_timeout,
        );

        for tag in expired {
            active
                .channel
                .basic_nack(
                    tag,
                    BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| unavailable("failed to requeue expired delivery", e))?;
            warn!(delivery_tag = tag, "rabbitmq_delivery_visibility_expired");
        }
        Ok(())
    }
}

fn is_not_found(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp) => {
            matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
        }
        _ => false,
    }
}

/// Whether a passive declare left its channel for us to close. RabbitMQ
/// closes the channel itself only for a 404.
fn scratch_left_open(err: Option<&lapin::Error>) -> bool {
    err.map_or(true, |e| !is_not_found(e))
}

fn headers_from(subject: Option<&str>, attributes: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in attributes {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    if let Some(subject) = subject {
        table.insert(
            ShortString::from(SUBJECT_HEADER),
            AMQPValue::LongString(LongString::from(subject.to_string())),
        );
    }
    table
}

fn attributes_from(headers: Option<&FieldTable>) -> (Option<String>, BTreeMap<String, String>) {
    let mut subject = None;
    let mut attributes = BTreeMap::new();

    let Some(table) = headers else {
        return (subject, attributes);
    };

    for (key, value) in table.inner() {
        let AMQPValue::LongString(text) = value else {
            continue;
        };
        let text = String::from_utf8_lossy(text.as_bytes()).into_owned();
        if key.as_str() == SUBJECT_HEADER {
            subject = Some(text);
        } else {
            attributes.insert(key.as_str().to_string(), text);
        }
    }

    (subject, attributes)
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn find_queue(&self, name: &str) -> Result<Lookup, BrokerError> {
        let channel = self.scratch_channel().await?;

        let result = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        if scratch_left_open(result.as_ref().err()) && channel.status().connected() {
            if let Err(e) = channel.close(200, "lookup done").await {
                debug!(error = %e, "rabbitmq_scratch_close_error");
            }
        }

        match result {
            Ok(_) => Ok(Lookup::Found(Self::handle_for(name))),
            Err(e) if is_not_found(&e) => Ok(Lookup::NotFound),
            Err(e) => Err(unavailable("failed to look up queue", e)),
        }
    }

    async fn create_queue(&self, name: &str) -> Result<QueueHandle, BrokerError> {
        let active = self.ensure_connected().await?;

        active
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| unavailable("failed to declare queue", e))?;

        info!(queue = name, "rabbitmq_queue_declared");
        Ok(Self::handle_for(name))
    }

    async fn send(
        &self,
        queue: &QueueHandle,
        message: OutboundMessage,
    ) -> Result<String, BrokerError> {
        let max = self.inner.max_message_bytes;
        if message.body.len() > max {
            return Err(BrokerError::MessageTooLarge {
                size: message.body.len(),
                max,
            });
        }

        let active = self.ensure_connected().await?;
        let message_id = Uuid::new_v4().to_string();

        let confirmation = active
            .channel
            .basic_publish(
                "",
                queue.name(),
                BasicPublishOptions::default(),
                message.body.as_bytes(),
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.clone().into())
                    .with_headers(headers_from(message.subject.as_deref(), &message.attributes)),
            )
            .await
            .map_err(|e| unavailable("failed to publish", e))?
            .await
            .map_err(|e| unavailable("failed to confirm publish", e))?;

        if confirmation.is_nack() {
            return Err(BrokerError::Rejected(format!(
                "broker nacked message {message_id}"
            )));
        }

        Ok(message_id)
    }

    async fn receive(
        &self,
        queue: &QueueHandle,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let active = self.ensure_connected().await?;
        let deadline = Instant::now() + wait;
        let mut batch = Vec::new();

        loop {
            self.requeue_expired(&active).await?;

            while batch.len() < max_messages {
                let got = active
                    .channel
                    .basic_get(queue.name(), BasicGetOptions { no_ack: false })
                    .await
                    .map_err(|e| unavailable("failed to get message", e))?;

                let Some(got) = got else {
                    break;
                };
                let delivery = got.delivery;
                let headers = delivery.properties.headers().as_ref();
                let (subject, attributes) = attributes_from(headers);
                let message_id = delivery.properties.message_id().as_ref().map(|s| s.to_string());

                let Some(local_count) = self.inner.in_flight.lock().await.track(
                    active.generation,
                    delivery.delivery_tag,
                    message_id.as_deref(),
                    Instant::now(),
                ) else {
                    // The channel was replaced underneath us; RabbitMQ requeues it.
                    continue;
                };

                let receive_count = header_receive_count(headers).or_else(|| {
                    if message_id.is_some() || !delivery.redelivered {
                        Some(local_count)
                    } else {
                        None
                    }
                });

                batch.push(ReceivedMessage {
                    message_id: message_id.unwrap_or_else(|| "unknown".to_string()),
                    body: String::from_utf8_lossy(&delivery.data).into_owned(),
                    subject,
                    attributes,
                    receipt: receipt_for(active.generation, delivery.delivery_tag),
                    receive_count,
                });
            }

            let now = Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            sleep(self.inner.poll_interval.min(deadline - now)).await;
        }
    }

    async fn delete(&self, _queue: &QueueHandle, receipt: &ReceiptToken) -> Result<(), BrokerError> {
        let (generation, delivery_tag) =
            parse_receipt(receipt).ok_or_else(|| BrokerError::InvalidReceipt(receipt.to_string()))?;

        let active = self.ensure_connected().await?;
        let settled = {
            let mut in_flight = self.inner.in_flight.lock().await;
            in_flight.sync(active.generation);
            generation == active.generation && in_flight.settle(generation, delivery_tag)
        };
        if !settled {
            return Err(BrokerError::InvalidReceipt(receipt.to_string()));
        }

        active
            .channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| unavailable("failed to ack", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_creation() {
        let broker = AmqpBroker::new("amqp://localhost:5672".to_string(), 1024, Duration::from_secs(30));
        assert!(Arc::strong_count(&broker.inner) == 1);
    }

    #[test]
    fn test_headers_round_trip_subject_and_attributes() {
        let attributes = BTreeMap::from([
            ("Scope".to_string(), "Lambda".to_string()),
            ("EventType".to_string(), "UserRegisteredEvent".to_string()),
        ]);

        let table = headers_from(Some("User#1"), &attributes);
        let (subject, decoded) = attributes_from(Some(&table));

        assert_eq!(subject.as_deref(), Some("User#1"));
        assert_eq!(decoded, attributes);
    }

    #[test]
    fn test_missing_headers_yield_no_attributes() {
        let (subject, attributes) = attributes_from(None);
        assert!(subject.is_none());
        assert!(attributes.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_message_rejected_before_connecting() {
        let broker = AmqpBroker::new("amqp://127.0.0.1:1".to_string(), 4, Duration::from_secs(30));
        let queue = AmqpBroker::handle_for("jobs");

        let result = broker
            .send(
                &queue,
                OutboundMessage {
                    body: "too long".to_string(),
                    subject: None,
                    attributes: BTreeMap::new(),
                },
            )
            .await;

        assert!(matches!(result, Err(BrokerError::MessageTooLarge { size: 8, max: 4 })));
    }

    #[tokio::test]
    async fn test_non_numeric_receipt_is_invalid() {
        let broker = AmqpBroker::new("amqp://127.0.0.1:1".to_string(), 1024, Duration::from_secs(30));
        let queue = AmqpBroker::handle_for("jobs");

        let result = broker.delete(&queue, &ReceiptToken::new("abc")).await;
        assert!(matches!(result, Err(BrokerError::InvalidReceipt(_))));
    }

    #[test]
    fn test_scratch_channel_closed_unless_broker_closed_it() {
        assert!(scratch_left_open(None));

        let outage = lapin::Error::InvalidChannelState(lapin::ChannelState::Closed);
        assert!(scratch_left_open(Some(&outage)));
    }

    #[test]
    fn test_receipt_carries_generation_and_tag() {
        let receipt = receipt_for(3, 41);
        assert_eq!(receipt.as_str(), "3:41");
        assert_eq!(parse_receipt(&receipt), Some((3, 41)));

        assert_eq!(parse_receipt(&ReceiptToken::new("41")), None);
        assert_eq!(parse_receipt(&ReceiptToken::new("x:41")), None);
        assert_eq!(parse_receipt(&ReceiptToken::new("3:")), None);
    }

    #[tokio::test]
    async fn test_bare_delivery_tag_is_not_a_receipt() {
        let broker = AmqpBroker::new("amqp://127.0.0.1:1".to_string(), 1024, Duration::from_secs(30));
        let queue = AmqpBroker::handle_for("jobs");

        let result = broker.delete(&queue, &ReceiptToken::new("7")).await;
        assert!(matches!(result, Err(BrokerError::InvalidReceipt(_))));
    }

    #[test]
    fn test_unacked_delivery_expires_after_visibility_window() {
        let window = Duration::from_secs(30);
        let start = Instant::now();
        let mut in_flight = InFlight::default();

        in_flight.track(1, 1, Some("m-1"), start);
        in_flight.track(1, 2, Some("m-2"), start + Duration::from_secs(20));

        assert!(in_flight.expire(1, start + Duration::from_secs(29), window).is_empty());
        assert_eq!(in_flight.expire(1, start + Duration::from_secs(30), window), vec![1]);
        // Requeued deliveries are gone; the other one is still claimable.
        assert!(in_flight.expire(1, start + Duration::from_secs(31), window).is_empty());
        assert!(!in_flight.settle(1, 1));
        assert!(in_flight.settle(1, 2));
        assert!(!in_flight.settle(1, 2));
    }

    #[test]
    fn test_receipt_from_previous_channel_cannot_settle() {
        let now = Instant::now();
        let mut in_flight = InFlight::default();
        in_flight.track(1, 5, Some("old"), now);

        // Reconnect: the new channel hands out tag 5 again.
        in_flight.track(2, 5, Some("new"), now);

        assert!(!in_flight.settle(1, 5));
        assert!(in_flight.settle(2, 5));
    }

    #[test]
    fn test_delivery_from_superseded_channel_is_not_tracked() {
        let now = Instant::now();
        let mut in_flight = InFlight::default();
        in_flight.track(2, 1, Some("a"), now);

        assert_eq!(in_flight.track(1, 9, Some("b"), now), None);
        assert!(in_flight.expire(1, now + Duration::from_secs(60), Duration::ZERO).is_empty());
    }

    #[test]
    fn test_receive_count_grows_with_redeliveries_and_resets_on_ack() {
        let window = Duration::from_secs(1);
        let start = Instant::now();
        let mut in_flight = InFlight::default();

        assert_eq!(in_flight.track(1, 1, Some("m"), start), Some(1));
        assert_eq!(in_flight.expire(1, start + window, window), vec![1]);
        assert_eq!(in_flight.track(1, 2, Some("m"), start + window), Some(2));
        assert_eq!(in_flight.track(1, 3, None, start + window), Some(1));

        assert!(in_flight.settle(1, 2));
        assert_eq!(in_flight.track(1, 4, Some("m"), start + window), Some(1));
    }

    #[test]
    fn test_delivery_count_header_maps_to_receive_count() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from(DELIVERY_COUNT_HEADER),
            AMQPValue::LongLongInt(2),
        );
        assert_eq!(header_receive_count(Some(&table)), Some(3));

        let mut table = FieldTable::default();
        table.insert(ShortString::from(DELIVERY_COUNT_HEADER), AMQPValue::LongInt(-1));
        assert_eq!(header_receive_count(Some(&table)), None);

        assert_eq!(header_receive_count(Some(&FieldTable::default())), None);
        assert_eq!(header_receive_count(None), None);
    }

    #[test]
    fn test_delivery_count_header_is_not_an_attribute() {
        let mut table = headers_from(None, &BTreeMap::new());
        table.insert(
            ShortString::from(DELIVERY_COUNT_HEADER),
            AMQPValue::LongLongInt(1),
        );

        let (_, attributes) = attributes_from(Some(&table));
        assert!(attributes.is_empty());
    }
}

//! In-process broker with queue-service delivery semantics.
//!
//! Messages received but not deleted stay hidden for the visibility window
//! and then become receivable again under a fresh receipt token. Useful for
//! tests and single-process deployments; nothing is persisted.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use super::{Broker, Lookup, OutboundMessage, QueueHandle, ReceiptToken, ReceivedMessage};
use crate::error::BrokerError;

/// Tunables for [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// How long a received message stays hidden before redelivery.
    pub visibility_timeout: Duration,
    /// Largest accepted message body, in bytes.
    pub max_message_bytes: usize,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_message_bytes: 256 * 1024,
        }
    }
}

/// Thread-safe in-memory broker. Clones share the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

#[derive(Default)]
struct Inner {
    config: MemoryBrokerConfig,
    state: Mutex<State>,
    arrivals: Notify,
    available: AtomicBool,
    create_calls: AtomicUsize,
    receive_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Vec<StoredMessage>>,
    next_message: u64,
    next_receipt: u64,
}

struct StoredMessage {
    id: String,
    body: String,
    subject: Option<String>,
    attributes: BTreeMap<String, String>,
    visible_at: Instant,
    receipt: Option<String>,
    receive_count: u32,
}

impl InMemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                available: AtomicBool::new(true),
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker is offline".to_string()))
        }
    }

    fn handle_for(name: &str) -> QueueHandle {
        QueueHandle::new(name, format!("memory://{name}"))
    }

    /// Simulate the broker going offline (or coming back).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of `create_queue` calls made, successful or not.
    pub fn create_calls(&self) -> usize {
        self.inner.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `receive` calls made.
    pub fn receive_calls(&self) -> usize {
        self.inner.receive_calls.load(Ordering::SeqCst)
    }

    /// Number of successful deletes.
    pub fn delete_calls(&self) -> usize {
        self.inner.delete_calls.load(Ordering::SeqCst)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages still held by a queue, visible or in flight.
    pub fn depth(&self, name: &str) -> usize {
        self.state().queues.get(name).map_or(0, Vec::len)
    }

    /// Bodies of every message still held by a queue, oldest first.
    pub fn bodies(&self, name: &str) -> Vec<String> {
        self.state()
            .queues
            .get(name)
            .map(|messages| messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn find_queue(&self, name: &str) -> Result<Lookup, BrokerError> {
        self.check_available()?;

        if self.state().queues.contains_key(name) {
            Ok(Lookup::Found(Self::handle_for(name)))
        } else {
            Ok(Lookup::NotFound)
        }
    }

    async fn create_queue(&self, name: &str) -> Result<QueueHandle, BrokerError> {
        self.inner.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        self.state().queues.entry(name.to_string()).or_default();
        debug!(queue = name, "memory_queue_created");

        Ok(Self::handle_for(name))
    }

    async fn send(
        &self,
        queue: &QueueHandle,
        message: OutboundMessage,
    ) -> Result<String, BrokerError> {
        self.check_available()?;

        let max = self.inner.config.max_message_bytes;
        if message.body.len() > max {
            return Err(BrokerError::MessageTooLarge {
                size: message.body.len(),
                max,
            });
        }

        let id = {
            let mut state = self.state();
            state.next_message += 1;
            let id = format!("msg-{}", state.next_message);

            let messages = state
                .queues
                .get_mut(queue.name())
                .ok_or_else(|| BrokerError::QueueNotFound(queue.name().to_string()))?;

            messages.push(StoredMessage {
                id: id.clone(),
                body: message.body,
                subject: message.subject,
                attributes: message.attributes,
                visible_at: Instant::now(),
                receipt: None,
                receive_count: 0,
            });
            id
        };

        self.inner.arrivals.notify_waiters();
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &QueueHandle,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.inner.receive_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let deadline = Instant::now() + wait;
        let visibility = self.inner.config.visibility_timeout;

        loop {
            // Register interest before inspecting the queue so a send that
            // lands in between still wakes us.
            let arrival = self.inner.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let next_visible = {
                let mut guard = self.state();
                let State {
                    queues,
                    next_receipt,
                    ..
                } = &mut *guard;

                let messages = queues
                    .get_mut(queue.name())
                    .ok_or_else(|| BrokerError::QueueNotFound(queue.name().to_string()))?;

                let now = Instant::now();
                let mut batch = Vec::new();
                for stored in messages.iter_mut() {
                    if batch.len() >= max_messages {
                        break;
                    }
                    if stored.visible_at > now {
                        continue;
                    }

                    *next_receipt += 1;
                    let receipt = format!("{}-r{}", stored.id, next_receipt);
                    stored.receipt = Some(receipt.clone());
                    stored.visible_at = now + visibility;
                    stored.receive_count += 1;

                    batch.push(ReceivedMessage {
                        message_id: stored.id.clone(),
                        body: stored.body.clone(),
                        subject: stored.subject.clone(),
                        attributes: stored.attributes.clone(),
                        receipt: ReceiptToken::new(receipt),
                        receive_count: Some(stored.receive_count),
                    });
                }

                if !batch.is_empty() {
                    return Ok(batch);
                }

                messages.iter().map(|m| m.visible_at).min()
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut arrival => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, queue: &QueueHandle, receipt: &ReceiptToken) -> Result<(), BrokerError> {
        self.check_available()?;

        let mut state = self.state();
        let messages = state
            .queues
            .get_mut(queue.name())
            .ok_or_else(|| BrokerError::QueueNotFound(queue.name().to_string()))?;

        let now = Instant::now();
        let position = messages.iter().position(|m| {
            m.receipt.as_deref() == Some(receipt.as_str()) && m.visible_at > now
        });

        match position {
            Some(index) => {
                messages.remove(index);
                self.inner.delete_calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(BrokerError::InvalidReceipt(receipt.to_string())),
        }
    }
}

//! Logical destination resolution with get-or-create semantics.
//!
//! Resolution is cached per process. Each name gets its own [`OnceCell`], so
//! concurrent callers for the same name wait on a single lookup-or-create
//! while different names resolve independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::broker::{Broker, Lookup, QueueHandle};
use crate::error::{millis, BrokerError, ResolveError};

/// Bounded exponential backoff for broker namespace calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts before giving up; `None` retries indefinitely.
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`, doubling from the initial delay
    /// with up to 10% jitter, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let base = self
            .initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);

        let jitter_ms = millis(base) / 10;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };

        (base + Duration::from_millis(jitter)).min(self.max_backoff)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// How a name was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(QueueHandle),
    Created(QueueHandle),
}

impl Resolution {
    pub fn handle(&self) -> &QueueHandle {
        match self {
            Self::Found(handle) | Self::Created(handle) => handle,
        }
    }

    pub fn into_handle(self) -> QueueHandle {
        match self {
            Self::Found(handle) | Self::Created(handle) => handle,
        }
    }
}

/// Resolves logical names to broker handles, creating resources on first use.
pub struct ResourceResolver {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
    resolved: Mutex<HashMap<String, Arc<OnceCell<QueueHandle>>>>,
}

impl ResourceResolver {
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        Self {
            broker,
            retry,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `name` to a handle, creating the resource if it is missing.
    pub async fn resolve(&self, name: &str) -> Result<QueueHandle, ResolveError> {
        self.resolve_detailed(name).await.map(Resolution::into_handle)
    }

    /// Like [`resolve`](Self::resolve) but reports whether this call created
    /// the resource. Cached resolutions report `Found`.
    pub async fn resolve_detailed(&self, name: &str) -> Result<Resolution, ResolveError> {
        if name.is_empty() {
            return Err(ResolveError::InvalidName);
        }

        let cell = {
            let mut resolved = self.resolved.lock().await;
            Arc::clone(resolved.entry(name.to_string()).or_default())
        };

        let mut created = false;
        let flag = &mut created;
        let handle = cell
            .get_or_try_init(move || async move {
                let resolution = self.lookup_or_create(name).await?;
                *flag = matches!(resolution, Resolution::Created(_));
                Ok::<_, ResolveError>(resolution.into_handle())
            })
            .await?
            .clone();

        Ok(if created {
            Resolution::Created(handle)
        } else {
            Resolution::Found(handle)
        })
    }

    /// Query-then-create with retries. Only called once per name at a time.
    async fn lookup_or_create(&self, name: &str) -> Result<Resolution, ResolveError> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.try_lookup_or_create(name).await {
                Ok(resolution) => {
                    info!(
                        queue = name,
                        url = %resolution.handle(),
                        created = matches!(resolution, Resolution::Created(_)),
                        attempts = attempts,
                        "queue_resolved"
                    );
                    return Ok(resolution);
                }
                Err(source) if !source.is_transient() || self.retry.exhausted(attempts) => {
                    warn!(queue = name, attempts = attempts, error = %source, "queue_resolve_failed");
                    return Err(ResolveError::ResourceUnavailable {
                        name: name.to_string(),
                        attempts,
                        source,
                    });
                }
                Err(source) => {
                    let delay = self.retry.backoff(attempts);
                    warn!(
                        queue = name,
                        attempts = attempts,
                        backoff_ms = millis(delay),
                        error = %source,
                        "queue_resolve_retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn try_lookup_or_create(&self, name: &str) -> Result<Resolution, BrokerError> {
        match self.broker.find_queue(name).await? {
            Lookup::Found(handle) => Ok(Resolution::Found(handle)),
            Lookup::NotFound => {
                info!(queue = name, "queue_not_found_creating");
                let handle = self.broker.create_queue(name).await?;
                Ok(Resolution::Created(handle))
            }
        }
    }
}

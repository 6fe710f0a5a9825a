//! End-to-end publish → consume scenarios against the in-memory broker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald::{
    Broker, Consumer, ConsumerOptions, DeliveryInfo, EnvelopeCodec, EventHandler, HandlerError,
    InMemoryBroker, MemoryBrokerConfig, PublishError, Publisher, ResourceResolver, RetryPolicy,
    UserRegisteredEvent, USER_REGISTERED_QUEUE,
};

struct Harness {
    broker: InMemoryBroker,
    resolver: Arc<ResourceResolver>,
    publisher: Publisher,
}

fn harness(config: MemoryBrokerConfig) -> Harness {
    let broker = InMemoryBroker::new(config);
    let shared: Arc<dyn Broker> = Arc::new(broker.clone());
    let resolver = Arc::new(ResourceResolver::new(
        Arc::clone(&shared),
        RetryPolicy {
            max_attempts: Some(3),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
    ));
    let publisher = Publisher::new(shared, Arc::clone(&resolver), EnvelopeCodec::with_scope("Lambda"));

    Harness {
        broker,
        resolver,
        publisher,
    }
}

fn options() -> ConsumerOptions {
    ConsumerOptions {
        batch_size: 10,
        wait: Duration::from_millis(20),
        error_backoff: Duration::from_millis(5),
        ..ConsumerOptions::default()
    }
}

/// Collects every event it sees; fails for user names in `fail_for`.
#[derive(Default)]
struct Collector {
    fail_for: Vec<String>,
    seen: Mutex<Vec<UserRegisteredEvent>>,
}

#[async_trait]
impl EventHandler for Collector {
    type Event = UserRegisteredEvent;

    async fn handle(
        &self,
        event: UserRegisteredEvent,
        _delivery: &DeliveryInfo,
    ) -> Result<(), HandlerError> {
        let failing = self.fail_for.iter().any(|n| n == event.user_name());
        self.seen.lock().unwrap().push(event);
        if failing {
            Err(HandlerError::msg("simulated failure"))
        } else {
            Ok(())
        }
    }
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn publish_to_new_queue_creates_it_once_and_delivers_event() {
    let h = harness(MemoryBrokerConfig::default());
    let user_id = Uuid::new_v4();
    let event = UserRegisteredEvent::new(user_id, "alice", "a@x.com");

    h.publisher.publish(USER_REGISTERED_QUEUE, &event).await.unwrap();
    assert_eq!(h.broker.queue_names(), vec![USER_REGISTERED_QUEUE.to_string()]);
    assert_eq!(h.broker.create_calls(), 1);

    let collector = Arc::new(Collector::default());
    let consumer = Consumer::new(
        USER_REGISTERED_QUEUE,
        Arc::new(h.broker.clone()),
        Arc::clone(&h.resolver),
        Arc::clone(&collector),
        options(),
    );
    let cancel = CancellationToken::new();
    let task = tokio::spawn(consumer.run(cancel.clone()));

    eventually(|| h.broker.delete_calls() == 1).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    let seen = collector.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![event.clone()]);
    assert_eq!(seen[0].user_id(), user_id);
    assert_eq!(seen[0].user_name(), "alice");
    assert_eq!(seen[0].email(), "a@x.com");

    h.publisher.publish(USER_REGISTERED_QUEUE, &event).await.unwrap();
    assert_eq!(h.broker.create_calls(), 1);
    assert_eq!(h.broker.queue_names().len(), 1);
}

#[tokio::test]
async fn failed_envelope_is_redelivered_after_visibility_window() {
    let h = harness(MemoryBrokerConfig {
        visibility_timeout: Duration::from_millis(150),
        ..Default::default()
    });

    for name in ["first", "second", "third"] {
        let event = UserRegisteredEvent::new(Uuid::new_v4(), name, format!("{name}@x.com"));
        h.publisher.publish("signups", &event).await.unwrap();
    }

    let failing = Arc::new(Collector {
        fail_for: vec!["second".to_string()],
        ..Default::default()
    });
    let consumer = Consumer::new(
        "signups",
        Arc::new(h.broker.clone()),
        Arc::clone(&h.resolver),
        Arc::clone(&failing),
        options(),
    );
    let cancel = CancellationToken::new();
    let task = tokio::spawn(consumer.run(cancel.clone()));

    eventually(|| h.broker.delete_calls() == 2).await;
    cancel.cancel();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(summary.acknowledged, 2);
    assert_eq!(h.broker.depth("signups"), 1);
    assert!(h.broker.bodies("signups")[0].contains("\"second\""));

    // A healthy consumer picks the envelope up once the window has passed.
    let healthy = Arc::new(Collector::default());
    let consumer = Consumer::new(
        "signups",
        Arc::new(h.broker.clone()),
        Arc::clone(&h.resolver),
        Arc::clone(&healthy),
        options(),
    );
    let cancel = CancellationToken::new();
    let task = tokio::spawn(consumer.run(cancel.clone()));

    eventually(|| h.broker.depth("signups") == 0).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    let seen = healthy.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].user_name(), "second");
    assert_eq!(h.broker.delete_calls(), 3);
}

#[tokio::test]
async fn oversized_event_is_reported_not_dropped() {
    let h = harness(MemoryBrokerConfig {
        max_message_bytes: 256,
        ..Default::default()
    });
    let event = UserRegisteredEvent::new(Uuid::new_v4(), "x".repeat(1_000), "a@x.com");

    let err = h.publisher.publish(USER_REGISTERED_QUEUE, &event).await.unwrap_err();

    assert!(matches!(err, PublishError::DeliveryRejected { .. }));
    assert_eq!(h.broker.depth(USER_REGISTERED_QUEUE), 0);
}

#[tokio::test]
async fn independent_consumers_share_nothing_but_the_broker() {
    let h = harness(MemoryBrokerConfig::default());
    for queue in ["alpha", "beta"] {
        let event = UserRegisteredEvent::new(Uuid::new_v4(), queue, format!("{queue}@x.com"));
        h.publisher.publish(queue, &event).await.unwrap();
    }

    let alpha = Arc::new(Collector::default());
    let beta = Arc::new(Collector::default());
    let cancel = CancellationToken::new();

    let tasks = [("alpha", &alpha), ("beta", &beta)].map(|(queue, collector)| {
        let consumer = Consumer::new(
            queue,
            Arc::new(h.broker.clone()),
            Arc::clone(&h.resolver),
            Arc::clone(collector),
            options(),
        );
        tokio::spawn(consumer.run(cancel.clone()))
    });

    eventually(|| h.broker.delete_calls() == 2).await;
    cancel.cancel();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(alpha.seen.lock().unwrap()[0].user_name(), "alpha");
    assert_eq!(beta.seen.lock().unwrap()[0].user_name(), "beta");
}

use routeminds_core::event::SerializedEvent;
use routeminds_core::event_bus::{
    Acknowledge, Delivery, DeliveryStream, EventBus, EventBusError,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// In-memory event bus with at-least-once semantics.
///
/// - Every subscription receives every event published to its topics.
/// - Events published before anyone subscribed are held and handed to the
///   first subscriber of that topic.
/// - A rejected delivery (explicitly, or by dropping it unacknowledged) is put
///   back on the same subscription with its delivery count incremented.
///
/// Clones share the same bus.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Pending>>>>,
    backlog: Mutex<HashMap<String, Vec<SerializedEvent>>>,
    published: Mutex<Vec<(String, SerializedEvent)>>,
    acked: AtomicUsize,
    rejected: AtomicUsize,
    fail_publish: AtomicBool,
}

struct Pending {
    event: SerializedEvent,
    delivery_count: u32,
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    redeliver: mpsc::UnboundedSender<Pending>,
    event: SerializedEvent,
    delivery_count: u32,
}

impl Acknowledge for InMemoryAcker {
    fn ack(self: Box<Self>) {
        self.inner.acked.fetch_add(1, Ordering::SeqCst);
    }

    fn reject(self: Box<Self>) {
        self.inner.rejected.fetch_add(1, Ordering::SeqCst);
        let pending = Pending {
            event: self.event,
            delivery_count: self.delivery_count + 1,
        };
        if self.redeliver.send(pending).is_err() {
            tracing::debug!("Subscription closed, rejected delivery dropped");
        }
    }
}

impl InMemoryEventBus {
    /// Create a new bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published to `topic`, in publish order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<SerializedEvent> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Number of deliveries acknowledged so far.
    #[must_use]
    pub fn acked_count(&self) -> usize {
        self.inner.acked.load(Ordering::SeqCst)
    }

    /// Number of deliveries rejected so far.
    #[must_use]
    pub fn rejected_count(&self) -> usize {
        self.inner.rejected.load(Ordering::SeqCst)
    }

    /// Make every publish fail until reset with `false`.
    pub fn set_publish_failure(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();

        Box::pin(async move {
            if self.inner.fail_publish.load(Ordering::SeqCst) {
                return Err(EventBusError::PublishFailed {
                    topic,
                    reason: "injected publish failure".to_string(),
                });
            }

            self.inner
                .published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((topic.clone(), event.clone()));

            let mut subscribers = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let senders = subscribers.entry(topic.clone()).or_default();
            senders.retain(|tx| !tx.is_closed());

            if senders.is_empty() {
                self.inner
                    .backlog
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(topic)
                    .or_default()
                    .push(event);
                return Ok(());
            }

            for tx in senders.iter() {
                // Closed receivers were pruned above; a race here only loses a
                // delivery to a subscriber that is going away.
                let _ = tx.send(Pending {
                    event: event.clone(),
                    delivery_count: 1,
                });
            }
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            if topics.is_empty() {
                return Err(EventBusError::SubscriptionFailed {
                    topics,
                    reason: "no topics given".to_string(),
                });
            }

            let (tx, mut rx) = mpsc::unbounded_channel::<Pending>();
            {
                let mut subscribers = self
                    .inner
                    .subscribers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let mut backlog = self
                    .inner
                    .backlog
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);

                for topic in &topics {
                    subscribers.entry(topic.clone()).or_default().push(tx.clone());
                    for event in backlog.remove(topic).unwrap_or_default() {
                        let _ = tx.send(Pending {
                            event,
                            delivery_count: 1,
                        });
                    }
                }
            }

            tracing::debug!(topics = ?topics, "In-memory subscription created");

            let inner = Arc::clone(&self.inner);
            let stream = async_stream::stream! {
                while let Some(pending) = rx.recv().await {
                    let acker = InMemoryAcker {
                        inner: Arc::clone(&inner),
                        redeliver: tx.clone(),
                        event: pending.event.clone(),
                        delivery_count: pending.delivery_count,
                    };
                    yield Ok::<_, EventBusError>(Delivery::new(
                        pending.event,
                        pending.delivery_count,
                        Box::new(acker),
                    ));
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

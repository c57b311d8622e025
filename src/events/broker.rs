use crate::events::Event;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// In-memory fan-out of request outcome events.
///
/// Every subscriber owns a bounded queue. `publish` is try-send only: a full
/// queue drops the event for that subscriber and nobody else, and the
/// publisher never waits. Within one subscriber, delivery preserves publish
/// order; there is no ordering across subscribers.
pub struct EventBroker {
    subscribers: Arc<DashMap<u64, mpsc::Sender<Event>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    capacity: usize,
}

impl EventBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Broadcast to all current subscribers without ever blocking.
    pub fn publish(&self, event: Event) {
        let mut closed: Vec<u64> = Vec::new();

        for entry in self.subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("gateway_events_dropped_total", "queue" => "broker")
                        .increment(1);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(*entry.key());
                }
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
        }
    }

    /// Register a new subscriber queue. Dropping (or cancelling) the returned
    /// [`Subscription`] unregisters it; the stream then ends once its buffer
    /// is drained.
    pub fn subscribe(&self) -> (EventStream, Subscription) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        (
            EventStream { rx },
            Subscription {
                id,
                subscribers: self.subscribers.clone(),
            },
        )
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Total events dropped across all subscriber queues.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Removes its queue from the broker registry on cancel or drop. Events
/// published afterwards are not delivered.
pub struct Subscription {
    id: u64,
    subscribers: Arc<DashMap<u64, mpsc::Sender<Event>>>,
}

impl Subscription {
    pub fn cancel(self) {
        // Removal happens in Drop.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.remove(&self.id);
    }
}

/// Receiving half of a subscription.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for EventStream {
    type Item = Event;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

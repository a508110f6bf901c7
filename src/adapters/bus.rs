//! Bounded event queue with a single consumer thread fanning out to
//! subscriber outboxes. Producers block when the queue is full (backpressure,
//! not a drop policy); a subscriber whose outbox is full or closed is
//! deregistered so one slow consumer cannot stall the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use tokio::sync::mpsc as outbox;

use crate::core::events::BusEvent;
use crate::core::ports::emitter::EventSink;

const EVENT_QUEUE_CAPACITY: usize = 100;
const SUBSCRIBER_OUTBOX_CAPACITY: usize = 32;

type SubscriberMap = Arc<Mutex<HashMap<u64, outbox::Sender<BusEvent>>>>;

pub struct EventBus {
    queue_tx: mpsc::SyncSender<BusEvent>,
    subscribers: SubscriberMap,
    next_subscriber_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::sync_channel::<BusEvent>(EVENT_QUEUE_CAPACITY);
        let subscribers: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));

        let fanout = subscribers.clone();
        std::thread::Builder::new()
            .name("trellis-bus".to_string())
            .spawn(move || {
                // Ends when the last producer handle is dropped.
                for event in queue_rx {
                    deliver(&fanout, event);
                }
            })
            .expect("failed to spawn event bus thread");

        Self {
            queue_tx,
            subscribers,
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Registers a new subscriber. The `init` event is seeded into the fresh
    /// outbox before registration so it is always the first event seen.
    pub fn subscribe(&self, init: BusEvent) -> outbox::Receiver<BusEvent> {
        let (tx, rx) = outbox::channel(SUBSCRIBER_OUTBOX_CAPACITY);
        let _ = tx.try_send(init);

        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("subscriber registry lock poisoned")
            .insert(id, tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber registry lock poisoned")
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: BusEvent) {
        if self.queue_tx.send(event).is_err() {
            log::error!("Event bus consumer is gone; dropping event");
        }
    }
}

/// Snapshot the registry before sending so a slow or dead subscriber never
/// blocks delivery to the others; failures are collected and pruned after.
fn deliver(subscribers: &SubscriberMap, event: BusEvent) {
    let targets: Vec<(u64, outbox::Sender<BusEvent>)> = {
        let guard = subscribers
            .lock()
            .expect("subscriber registry lock poisoned");
        guard.iter().map(|(id, tx)| (*id, tx.clone())).collect()
    };

    if targets.is_empty() {
        return;
    }

    let mut dead = Vec::new();
    for (id, tx) in targets {
        if let Err(error) = tx.try_send(event.clone()) {
            log::warn!("Dropping subscriber {}: {}", id, error);
            dead.push(id);
        }
    }

    if !dead.is_empty() {
        let mut guard = subscribers
            .lock()
            .expect("subscriber registry lock poisoned");
        for id in dead {
            guard.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::core::events::{ErrorEvent, TreeSnapshot};

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn subscriber_sees_init_first_then_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(BusEvent::Init(TreeSnapshot::new()));

        let first = rx.try_recv().expect("init event is already queued");
        assert_eq!(first.kind(), "init");

        bus.publish(BusEvent::Error(ErrorEvent {
            message: "boom".to_string(),
        }));

        assert!(wait_until(Duration::from_secs(2), || {
            matches!(rx.try_recv(), Ok(event) if event.kind() == "error")
        }));
    }

    #[test]
    fn dropped_receiver_is_deregistered_on_next_delivery() {
        let bus = EventBus::new();
        let rx = bus.subscribe(BusEvent::Init(TreeSnapshot::new()));
        assert_eq!(bus.subscriber_count(), 1);

        drop(rx);
        bus.publish(BusEvent::Update(TreeSnapshot::new()));

        assert!(wait_until(Duration::from_secs(2), || {
            bus.subscriber_count() == 0
        }));
    }

    #[test]
    fn slow_subscriber_with_full_outbox_is_disconnected() {
        let bus = EventBus::new();
        // Never drained; the init event already occupies one slot.
        let _rx = bus.subscribe(BusEvent::Init(TreeSnapshot::new()));

        for _ in 0..(SUBSCRIBER_OUTBOX_CAPACITY + 8) {
            bus.publish(BusEvent::Update(TreeSnapshot::new()));
        }

        assert!(wait_until(Duration::from_secs(2), || {
            bus.subscriber_count() == 0
        }));
    }
}

use crate::core::events::BusEvent;

/// Seam between the core (tree store, sync engine) and the notification
/// fan-out. Production wires in the channel-backed bus; tests wire in a
/// recording sink.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: BusEvent);
}

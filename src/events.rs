//! Fire-and-forget lease lifecycle events (spec §4.2, §6.1).

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub enum LeaseEvent {
    /// Fired after every successful renewal.
    Renewed {
        lease_name: String,
        lease_id: Uuid,
        timestamp: DateTime<Utc>,
        new_expires_at: DateTime<Utc>,
        /// `new_expires_at - previous_expires_at`. Not clamped to
        /// non-negative — see spec §9.
        observed_extension: chrono::Duration,
    },
    /// Fired after every failed renewal attempt (but not on the terminal
    /// `Lost` transition itself).
    RenewalFailed {
        lease_name: String,
        lease_id: Uuid,
        timestamp: DateTime<Utc>,
        attempt_number: u32,
        error: String,
        will_retry: bool,
    },
    /// Terminal. Fired at most once per handle.
    Lost {
        lease_name: String,
        lease_id: Uuid,
        timestamp: DateTime<Utc>,
        reason: String,
        last_successful_renewal: DateTime<Utc>,
    },
}

/// Capacity of the broadcast channel backing [`crate::handle::LeaseHandle::subscribe`].
/// A lagging subscriber drops the oldest buffered events rather than
/// blocking the renewer (spec §9's "bounded buffer with drop-oldest").
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// A synchronous callback registered via
/// [`crate::handle::LeaseHandle::on_event`]. Panics inside a callback are
/// caught at the dispatch boundary and discarded (spec §7).
pub type EventCallback = Box<dyn Fn(&LeaseEvent) + Send + Sync>;

pub(crate) struct EventDispatcher {
    sender: tokio::sync::broadcast::Sender<LeaseEvent>,
    callbacks: parking_lot::Mutex<Vec<EventCallback>>,
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender,
            callbacks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LeaseEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn register(&self, callback: EventCallback) {
        self.callbacks.lock().push(callback);
    }

    pub(crate) fn dispatch(&self, event: LeaseEvent) {
        // A slow/missing broadcast consumer never blocks here: `send`
        // returns immediately whether or not there are active receivers.
        let _ = self.sender.send(event.clone());

        for callback in self.callbacks.lock().iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&event);
            }));
            if let Err(_panic) = result {
                log::warn!("lease event callback panicked; discarding");
            }
        }
    }
}

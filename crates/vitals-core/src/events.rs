//! Sync event system.
//!
//! Components broadcast what they are doing so presentation code can show
//! progress and status without polling.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use vitals_types::{RegistrationStatus, SyncResult, SyncStrategy};

/// Events emitted by the engine.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SyncEvent {
    /// A sync attempt acquired the guard and started.
    SyncStarted {
        user_id: String,
        strategy: Option<SyncStrategy>,
    },
    /// One day was pulled, cached and uploaded.
    DaySynced { user_id: String, date: String },
    /// One day failed; the attempt continues with the next day.
    DayFailed {
        user_id: String,
        date: String,
        error: String,
    },
    /// A sync attempt finished (successfully or not).
    SyncCompleted { result: SyncResult },
    /// A sync call was rejected because another one was running.
    SyncRejected,
    /// The device registration status changed.
    RegistrationChanged { status: RegistrationStatus },
    /// Today's snapshot was refreshed from the health source.
    CacheRefreshed { date: String },
    /// A best-effort push of the live snapshot failed.
    PushFailed { error: String },
}

/// Sender for sync events.
pub type EventSender = broadcast::Sender<SyncEvent>;

/// Receiver for sync events.
pub type EventReceiver = broadcast::Receiver<SyncEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SyncEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

//! Fire-and-forget event publishing.

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::{IdAndVersion, TableState};

/// Events the engine publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A query was served from the cache.
    CacheHit {
        /// Hash of the cached request.
        hash: String,
    },
    /// A table's index status changed.
    TableStateChanged {
        /// The table.
        table: IdAndVersion,
        /// The new state.
        state: TableState,
    },
}

/// Publishes events. Never awaited and never retried by the engine.
pub trait Notifier: Send + Sync {
    /// Publish `event`.
    fn notify(&self, event: EngineEvent);
}

/// Writes events to the `log` facade at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: EngineEvent) {
        debug!("engine event: {event:?}");
    }
}

/// Keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingNotifier {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far.
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

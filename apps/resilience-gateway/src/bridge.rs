//! Stand-in for the real-time notification layer.
//!
//! Change events are published under `<collection>_change` by logging them
//! as JSON. A websocket fan-out would replace this listener without touching
//! the change stream manager.

use db_resilience::change_stream::{ChangeEvent, ChangeListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct LoggingBridge {
    published: Arc<AtomicU64>,
}

impl LoggingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl ChangeListener for LoggingBridge {
    fn on_change(&self, event: &ChangeEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                info!(event = %event.event_name(), %payload, "Publishing change");
            }
            Err(e) => warn!(event = %event.event_name(), error = %e, "Failed to serialize change event"),
        }
    }
}

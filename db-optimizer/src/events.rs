//! Injected logging capability for the optimization engine.
//!
//! Components never log recovered failures through a global logger directly.
//! They receive an [`EventSink`] at construction and report [`Event`]s to it,
//! which lets tests observe exactly which warnings a pass produced.
//!
//! ## Implementations
//!
//! - **TracingSink**: forwards every event to the `tracing` macros (default)
//! - **RecordingSink**: keeps events in memory for inspection

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Severity of an engine event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
}

/// A single message emitted by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub level: EventLevel,
    pub message: String,
}

impl Event {
    pub fn debug(message: impl Into<String>) -> Self {
        Self {
            level: EventLevel::Debug,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: EventLevel::Info,
            message: message.into(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            level: EventLevel::Warn,
            message: message.into(),
        }
    }
}

/// Destination for engine events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: Event) {
        match event.level {
            EventLevel::Debug => debug!("{}", event.message),
            EventLevel::Info => info!("{}", event.message),
            EventLevel::Warn => warn!("{}", event.message),
        }
    }
}

/// Stores events in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.level == EventLevel::Warn)
            .map(|e| e.message)
            .collect()
    }

    /// Whether any warning contains `needle`
    pub fn has_warning(&self, needle: &str) -> bool {
        self.warnings().iter().any(|w| w.contains(needle))
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn recording_sink_keeps_order_and_filters_warnings() {
        let sink = RecordingSink::new();
        sink.record(Event::info("starting"));
        sink.record(Event::warn("pass duplicate_index failed"));
        sink.record(Event::debug("done"));

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.events()[0], Event::info("starting"));
        assert_eq!(sink.warnings(), vec!["pass duplicate_index failed"]);
        assert!(sink.has_warning("duplicate_index"));
        assert!(!sink.has_warning("missing_fk_index"));
    }

    #[test]
    fn clones_share_the_same_buffer() {
        let sink = RecordingSink::new();
        let handle: Arc<dyn EventSink> = Arc::new(sink.clone());
        handle.record(Event::warn("shared"));
        assert!(sink.has_warning("shared"));
    }

    #[traced_test]
    #[test]
    fn tracing_sink_emits_warnings() {
        TracingSink.record(Event::warn("Failed to reindex table events"));
        assert!(logs_contain("Failed to reindex table events"));
    }
}

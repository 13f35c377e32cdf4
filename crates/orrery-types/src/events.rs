//! Typed event bus shared by the pipeline engine and the agent session.
//!
//! A process-local fan-out keyed per emitter instance: [`EventBus::on`]
//! appends a subscriber, [`EventBus::emit`] synchronously invokes each one
//! under a read lock of the subscriber list. Listeners must not block
//! indefinitely; each listener sees events in emit order, but no ordering
//! across listeners is guaranteed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// Every event kind emitted by the engine or an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Pipeline lifecycle
    PipelineStarted,
    PipelineCompleted,
    PipelineFailed,
    // Stage lifecycle
    StageStarted,
    StageCompleted,
    StageFailed,
    StageRetrying,
    // Parallel execution
    ParallelStarted,
    ParallelBranchStarted,
    ParallelBranchCompleted,
    ParallelCompleted,
    // Human interaction
    InterviewStarted,
    InterviewCompleted,
    InterviewTimeout,
    // Persistence
    CheckpointSaved,
    ValidationWarning,
    // Agent session
    SessionStarted,
    SessionClosed,
    TurnStarted,
    TurnCompleted,
    ToolCallStarted,
    ToolCallCompleted,
    TextDelta,
    ReasoningDelta,
    Error,
    LoopDetected,
    SteeringApplied,
}

/// A single event. The timestamp is assigned at emit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: chrono::Utc::now(),
            data: HashMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// In-memory synchronous fan-out of [`Event`]s.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for all events.
    pub fn on(&self, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.listeners
            .write()
            .expect("event bus lock poisoned")
            .push(Arc::new(listener));
    }

    /// Emit an event to every registered listener, in registration order.
    pub fn emit(&self, event: Event) {
        let listeners = self.listeners.read().expect("event bus lock poisoned");
        for listener in listeners.iter() {
            listener(&event);
        }
    }

    /// Shorthand for `emit(Event::new(kind))`.
    pub fn emit_kind(&self, kind: EventKind) {
        self.emit(Event::new(kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn listeners_receive_events_in_emit_order() {
        let bus = EventBus::new();
        let seen: Arc<Mutex<Vec<EventKind>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.on(move |e| seen_clone.lock().unwrap().push(e.kind));

        bus.emit_kind(EventKind::PipelineStarted);
        bus.emit_kind(EventKind::StageStarted);
        bus.emit_kind(EventKind::StageCompleted);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                EventKind::PipelineStarted,
                EventKind::StageStarted,
                EventKind::StageCompleted
            ]
        );
    }

    #[test]
    fn multiple_listeners_all_invoked() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            bus.on(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.emit_kind(EventKind::CheckpointSaved);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn emit_with_no_listeners_is_a_noop() {
        let bus = EventBus::new();
        bus.emit_kind(EventKind::Error);
    }

    #[test]
    fn event_serializes_kind_as_type_field() {
        let event = Event::new(EventKind::ToolCallStarted)
            .with("tool_name", serde_json::json!("read_file"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_call_started");
        assert_eq!(json["data"]["tool_name"], "read_file");
    }

    #[test]
    fn timestamp_assigned_at_construction() {
        let before = chrono::Utc::now();
        let event = Event::new(EventKind::SessionStarted);
        let after = chrono::Utc::now();
        assert!(event.timestamp >= before && event.timestamp <= after);
    }

    #[test]
    fn cloned_bus_shares_listeners() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let alias = bus.clone();
        alias.emit_kind(EventKind::TurnStarted);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

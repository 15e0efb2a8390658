//! Lifecycle event system.
//!
//! Every stage boundary, provider call, tool call, and stream transition
//! emits a [`RuntimeEvent`] onto the conversation's [`EventBus`]. The bus
//! fans events out to subscribers through bounded per-subscriber queues so
//! a slow subscriber can never stall a turn: on overflow the oldest queued
//! event is dropped and an [`EventType::EventDropped`] diagnostic is
//! injected. Per-conversation ordering is preserved (one publisher per
//! conversation, FIFO queues).
//!
//! Events are the public observability surface; see
//! [`MetricsCollector`](crate::metrics::MetricsCollector) for the bundled
//! metrics subscriber.
//!
//! # Example
//!
//! ```rust,no_run
//! use colloquy::event::{EventBus, EventSubscriber, RuntimeEvent};
//! use std::sync::Arc;
//!
//! struct Printer;
//! impl EventSubscriber for Printer {
//!     fn on_event(&self, event: &RuntimeEvent) {
//!         println!("{:?} {}", event.event_type, event.conversation_id);
//!     }
//! }
//!
//! let bus = EventBus::new();
//! bus.subscribe(Arc::new(Printer));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// The closed set of event types emitted by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// A turn pipeline started executing.
    #[serde(rename = "pipeline.started")]
    PipelineStarted,
    /// A turn pipeline finished successfully.
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted,
    /// A turn pipeline failed.
    #[serde(rename = "pipeline.failed")]
    PipelineFailed,
    /// A pipeline stage started.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// A pipeline stage completed; `data.elapsed_ms` carries its duration.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A pipeline stage failed.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// A provider round-trip started.
    #[serde(rename = "provider.call.started")]
    ProviderCallStarted,
    /// A provider round-trip completed; `data` carries token counts.
    #[serde(rename = "provider.call.completed")]
    ProviderCallCompleted,
    /// A provider round-trip failed (post-retry).
    #[serde(rename = "provider.call.failed")]
    ProviderCallFailed,
    /// A tool execution started.
    #[serde(rename = "tool.call.started")]
    ToolCallStarted,
    /// A tool execution completed.
    #[serde(rename = "tool.call.completed")]
    ToolCallCompleted,
    /// A tool execution failed.
    #[serde(rename = "tool.call.failed")]
    ToolCallFailed,
    /// Argument or pack validation failed.
    #[serde(rename = "validation.failed")]
    ValidationFailed,
    /// The outgoing context was assembled; `data` carries window sizes.
    #[serde(rename = "context.assembled")]
    ContextAssembled,
    /// A summary was created over a message range.
    #[serde(rename = "context.summarized")]
    ContextSummarized,
    /// Conversation state was persisted.
    #[serde(rename = "state.saved")]
    StateSaved,
    /// Persisting conversation state failed.
    #[serde(rename = "state.save.failed")]
    StateSaveFailed,
    /// Messages were appended to the log.
    #[serde(rename = "message.appended")]
    MessageAppended,
    /// A media part was preprocessed; `data` carries before/after sizes.
    #[serde(rename = "multimodal.processed")]
    MultimodalProcessed,
    /// A stream (text or duplex) started.
    #[serde(rename = "stream.started")]
    StreamStarted,
    /// A stream completed.
    #[serde(rename = "stream.completed")]
    StreamCompleted,
    /// A stream was cancelled by the caller.
    #[serde(rename = "stream.cancelled")]
    StreamCancelled,
    /// A stream failed.
    #[serde(rename = "stream.failed")]
    StreamFailed,
    /// A duplex turn was interrupted by barge-in.
    #[serde(rename = "stream.interrupted")]
    StreamInterrupted,
    /// Diagnostic: a subscriber queue overflowed and events were dropped.
    #[serde(rename = "event.dropped")]
    EventDropped,
}

/// A single lifecycle event with its correlation ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Emission time (RFC3339 when serialized).
    pub timestamp: DateTime<Utc>,
    /// Id of the enclosing run (one per `send`/`stream` call).
    pub run_id: String,
    /// Id of the enclosing session (one per conversation handle).
    pub session_id: String,
    /// Conversation id.
    pub conversation_id: String,
    /// Type-specific payload.
    pub data: serde_json::Value,
}

/// Receives events from the bus.
///
/// Implementations must not block: they run on a drain task per
/// subscriber, and a long-running `on_event` only delays that subscriber's
/// own queue.
pub trait EventSubscriber: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &RuntimeEvent);
}

struct SubscriberSlot {
    queue: Arc<Mutex<SlotQueue>>,
    notify: Arc<Notify>,
    handle: tokio::task::JoinHandle<()>,
}

struct SlotQueue {
    events: VecDeque<RuntimeEvent>,
    dropped: u64,
    closed: bool,
}

/// Fan-out bus with per-subscriber bounded queues.
pub struct EventBus {
    slots: Mutex<Vec<SubscriberSlot>>,
    capacity: usize,
}

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

impl EventBus {
    /// Create a bus with the default queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus with an explicit per-subscriber queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            capacity: capacity.max(2),
        }
    }

    /// Register a subscriber. Each subscriber gets its own bounded queue
    /// and drain task.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        let queue = Arc::new(Mutex::new(SlotQueue {
            events: VecDeque::new(),
            dropped: 0,
            closed: false,
        }));
        let notify = Arc::new(Notify::new());

        let drain_queue = Arc::clone(&queue);
        let drain_notify = Arc::clone(&notify);
        let handle = tokio::spawn(async move {
            loop {
                let batch: Vec<RuntimeEvent> = {
                    let mut q = drain_queue.lock().unwrap();
                    if q.events.is_empty() && q.closed {
                        return;
                    }
                    q.events.drain(..).collect()
                };
                for event in &batch {
                    subscriber.on_event(event);
                }
                if batch.is_empty() {
                    drain_notify.notified().await;
                }
            }
        });

        self.slots.lock().unwrap().push(SubscriberSlot {
            queue,
            notify,
            handle,
        });
    }

    /// Publish an event to every subscriber. Never blocks and never fails
    /// the caller.
    pub fn publish(&self, event: RuntimeEvent) {
        let slots = self.slots.lock().unwrap();
        for slot in slots.iter() {
            let mut q = slot.queue.lock().unwrap();
            if q.closed {
                continue;
            }
            while q.events.len() >= self.capacity {
                q.events.pop_front();
                q.dropped += 1;
            }
            if q.dropped > 0 && event.event_type != EventType::EventDropped {
                let dropped = q.dropped;
                q.dropped = 0;
                q.events.push_back(RuntimeEvent {
                    event_type: EventType::EventDropped,
                    timestamp: Utc::now(),
                    run_id: event.run_id.clone(),
                    session_id: event.session_id.clone(),
                    conversation_id: event.conversation_id.clone(),
                    data: serde_json::json!({ "dropped": dropped }),
                });
            }
            q.events.push_back(event.clone());
            slot.notify.notify_one();
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Stop all drain tasks after the queues empty.
    pub fn close(&self) {
        let slots = self.slots.lock().unwrap();
        for slot in slots.iter() {
            slot.queue.lock().unwrap().closed = true;
            slot.notify.notify_one();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        let slots = self.slots.lock().unwrap();
        for slot in slots.iter() {
            slot.handle.abort();
        }
    }
}

/// Correlation ids threaded through every event of a turn.
#[derive(Debug, Clone)]
pub struct EventScope {
    /// Run id (one per send/stream).
    pub run_id: String,
    /// Session id (one per handle).
    pub session_id: String,
    /// Conversation id.
    pub conversation_id: String,
}

impl EventScope {
    /// Build an event in this scope with the current timestamp.
    pub fn event(&self, event_type: EventType, data: serde_json::Value) -> RuntimeEvent {
        RuntimeEvent {
            event_type,
            timestamp: Utc::now(),
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            conversation_id: self.conversation_id.clone(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        seen: AtomicUsize,
        dropped_markers: AtomicUsize,
    }

    impl EventSubscriber for Counter {
        fn on_event(&self, event: &RuntimeEvent) {
            if event.event_type == EventType::EventDropped {
                self.dropped_markers.fetch_add(1, Ordering::SeqCst);
            } else {
                self.seen.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn scope() -> EventScope {
        EventScope {
            run_id: "r".into(),
            session_id: "s".into(),
            conversation_id: "c".into(),
        }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus = EventBus::new();
        let a = Arc::new(Counter {
            seen: AtomicUsize::new(0),
            dropped_markers: AtomicUsize::new(0),
        });
        let b = Arc::new(Counter {
            seen: AtomicUsize::new(0),
            dropped_markers: AtomicUsize::new(0),
        });
        bus.subscribe(a.clone());
        bus.subscribe(b.clone());

        for _ in 0..5 {
            bus.publish(scope().event(EventType::StageStarted, serde_json::json!({})));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(a.seen.load(Ordering::SeqCst), 5);
        assert_eq!(b.seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_with_diagnostic() {
        // Publish with no drain opportunity by flooding before yielding.
        let bus = EventBus::with_capacity(4);
        let counter = Arc::new(Counter {
            seen: AtomicUsize::new(0),
            dropped_markers: AtomicUsize::new(0),
        });
        bus.subscribe(counter.clone());

        for _ in 0..100 {
            bus.publish(scope().event(EventType::StageStarted, serde_json::json!({})));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let seen = counter.seen.load(Ordering::SeqCst);
        assert!(seen < 100, "expected drops, saw all {}", seen);
        assert!(counter.dropped_markers.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn event_serializes_with_dotted_type() {
        let event = scope().event(EventType::ToolCallCompleted, serde_json::json!({"tool": "add"}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool.call.completed");
        assert_eq!(json["conversation_id"], "c");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }
}

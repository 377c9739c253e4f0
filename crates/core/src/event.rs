//! Run events: live notifications about what the engine is doing.
//!
//! Events are published as soon as they are known (memories are announced
//! while their stream element is still open). Hosts subscribe to render
//! progress without polling the chain.

use crate::error::ErrorRecord;
use crate::memory::{Memory, MemoryId, MemoryRef};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All run events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: MemoryId,
        context: String,
    },

    StepStarted {
        run_id: MemoryId,
        step: u32,
    },

    /// A memory entered the chain (possibly still streaming).
    MemoryCreated { memory: Memory },

    /// Streamed text was appended to an open memory.
    ContentAppended { id: MemoryId, delta: String },

    MemoryFinalized { memory: Memory },

    /// A call ended with an `error` memory.
    CallFailed { call: MemoryRef, error: ErrorRecord },

    /// Published by handlers through `CallContext::emit`.
    Custom {
        name: String,
        data: serde_json::Value,
    },

    StepFinished {
        run_id: MemoryId,
        step: u32,
    },

    RunFinished {
        run_id: MemoryId,
        steps: u32,
        errors: usize,
    },
}

/// A broadcast-based event bus for run events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Slow
/// subscribers lag and lose old events; the engine never blocks on them.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<RunEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: RunEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RunEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(RunEvent::Custom {
            name: "progress".into(),
            data: serde_json::json!({"pct": 50}),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            RunEvent::Custom { name, data } => {
                assert_eq!(name, "progress");
                assert_eq!(data["pct"], 50);
            }
            _ => panic!("Expected Custom event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(RunEvent::StepStarted {
            run_id: MemoryId::new(),
            step: 1,
        });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = RunEvent::ContentAppended {
            id: MemoryId::from("m-1"),
            delta: "hi".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "content_appended");
        assert_eq!(json["id"], "m-1");
    }
}

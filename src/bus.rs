//! One-way event bus with typed topics.
//!
//! Components publish facts about what just happened; downstream consumers
//! subscribe without holding references to the producing store. This keeps
//! the cognitive, EIDOS, advisory, and promotion components acyclic:
//! back-references are lookups by key, never object pointers.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// A fact published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum BusEvent {
    /// A quality insight was inserted or merged into the cognitive store.
    InsightUpserted {
        key: String,
        category: String,
        reliability: f64,
    },
    /// An EIDOS step reached a terminal state.
    StepSealed {
        session_id: String,
        step_id: String,
        evaluation: String,
    },
    /// The aggregator produced a new distillation.
    DistillationCreated {
        distillation_id: String,
        dtype: String,
    },
    /// The advisory engine emitted advice to a caller.
    AdviceEmitted {
        session_id: String,
        tool: String,
        advice_ids: Vec<String>,
    },
}

/// Fan-out bus. Publishing never blocks; subscribers that have gone away
/// are pruned on the next publish.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<BusEvent>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> Receiver<BusEvent> {
        let (tx, rx) = channel();
        self.subscribers
            .lock()
            .expect("bus subscriber lock poisoned")
            .push(tx);
        rx
    }

    /// Publish an event to every live subscriber.
    pub fn publish(&self, event: BusEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("bus subscriber lock poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers (for tests and status).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("bus subscriber lock poisoned")
            .len()
    }
}

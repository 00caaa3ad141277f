//! Typed event bus decoupling the execution engine from user interfaces.
//!
//! Built on [`tokio::sync::broadcast`]: fan-out to every subscriber, bounded
//! per-subscriber buffer, oldest events dropped on overflow. A lagging
//! subscriber observes a [`Event::ConsumerLag`] carrying the number of
//! dropped events instead of silently missing them. Delivery is best-effort;
//! the engine never blocks on a slow consumer.

use tokio::sync::broadcast;

use crate::classify::FailureClass;

/// Default per-subscriber buffer capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Events emitted during goal execution.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Event {
    /// Incremental token output from a streaming LM response.
    LmTokenChunk {
        /// The text delta.
        text: String,
    },
    /// A tool call is about to execute.
    ToolStarted {
        /// Tool call id.
        id: String,
        /// Tool name.
        name: String,
    },
    /// A tool call finished.
    ToolCompleted {
        /// Tool call id.
        id: String,
        /// Tool name.
        name: String,
        /// Whether the tool reported success.
        ok: bool,
        /// Execution time in milliseconds.
        elapsed_ms: u64,
    },
    /// The compensation pipeline applied a repair.
    Compensation {
        /// The failure class that triggered the repair.
        class: FailureClass,
        /// The strategy or repair applied (e.g. `auto_fuzzy`, `refine_prompt`).
        strategy: String,
    },
    /// A plan step began.
    PlanStepStarted {
        /// Zero-based step index.
        index: usize,
        /// Step title.
        title: String,
    },
    /// A plan step completed successfully.
    PlanStepCompleted {
        /// Zero-based step index.
        index: usize,
        /// Step title.
        title: String,
    },
    /// A plan step failed past its budget.
    PlanStepFailed {
        /// Zero-based step index.
        index: usize,
        /// Step title.
        title: String,
        /// Failure detail.
        detail: String,
    },
    /// A workspace snapshot was committed.
    CheckpointTaken {
        /// Snapshot ref (commit id).
        snapshot: String,
        /// What the snapshot was taken after.
        description: String,
    },
    /// The workspace was rolled back to a snapshot.
    CheckpointRolledBack {
        /// The snapshot ref rolled back to.
        snapshot: String,
    },
    /// A goal started executing.
    GoalStarted {
        /// The goal text.
        goal: String,
    },
    /// A goal finished successfully.
    GoalCompleted {
        /// Human-readable summary with counters.
        summary: String,
    },
    /// A goal ended in failure.
    GoalFailed {
        /// Failure summary.
        summary: String,
    },
    /// A background task was enqueued.
    TaskSubmitted {
        /// Short hex task id.
        id: String,
    },
    /// A background task reached a terminal state.
    TaskCompleted {
        /// Short hex task id.
        id: String,
        /// Terminal status string (`succeeded`, `failed`, `cancelled`).
        status: String,
    },
    /// The policy engine rejected a tool call.
    PolicyViolation {
        /// Offending tool name.
        tool: String,
        /// Violation detail.
        detail: String,
    },
    /// Ring for UI consumers when a background task completes.
    TerminalBell,
    /// This subscriber fell behind and events were dropped.
    ConsumerLag {
        /// Number of events dropped for this subscriber.
        dropped: u64,
    },
}

/// Pub/sub handle. Cheap to clone; all clones share the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the default per-subscriber capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with an explicit per-subscriber capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all current subscribers. Never blocks; with no
    /// subscribers the event is discarded.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream from this point forward.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A single subscriber's view of the bus.
#[derive(Debug)]
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    /// Receive the next event.
    ///
    /// Returns `None` when the bus has been dropped. When this subscriber
    /// lagged, the overflow is reported in-band as [`Event::ConsumerLag`]
    /// and reception continues with the oldest retained event.
    pub async fn recv(&mut self) -> Option<Event> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                Some(Event::ConsumerLag { dropped })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking receive; `None` when no event is queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(dropped)) => {
                Some(Event::ConsumerLag { dropped })
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_in_emission_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(Event::GoalStarted { goal: "g".into() });
        bus.emit(Event::TerminalBell);

        for stream in [&mut a, &mut b] {
            assert!(matches!(stream.recv().await, Some(Event::GoalStarted { .. })));
            assert!(matches!(stream.recv().await, Some(Event::TerminalBell)));
        }
    }

    #[tokio::test]
    async fn test_lag_is_surfaced_with_drop_count() {
        let bus = EventBus::with_capacity(2);
        let mut stream = bus.subscribe();

        for i in 0..5 {
            bus.emit(Event::LmTokenChunk {
                text: i.to_string(),
            });
        }

        match stream.recv().await {
            Some(Event::ConsumerLag { dropped }) => assert_eq!(dropped, 3),
            other => panic!("expected ConsumerLag, got {other:?}"),
        }
        // Reception resumes with the oldest retained event.
        match stream.recv().await {
            Some(Event::LmTokenChunk { text }) => assert_eq!(text, "3"),
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(Event::TerminalBell);
    }
}

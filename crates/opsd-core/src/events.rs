//! In-process event bus with payload scrubbing.
//!
//! Publishers hand events to the bus; every subscriber receives a clone
//! over a buffered broadcast channel, so a slow subscriber lags (and
//! eventually drops messages) instead of blocking the publisher. Payloads
//! are deep-scrubbed of secret-like keys *before* the send, so no
//! subscriber - including the SSE transport - can observe raw secrets.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::scrub::scrub_value;

/// Default broadcast buffer capacity per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Reported worker availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// The worker is reachable.
    Online,
    /// The worker missed its heartbeat.
    Offline,
}

/// Phase of a dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DispatchPhase {
    /// The dispatcher handed the task to an agent.
    Started,
    /// The agent finished the dispatched work.
    Completed,
    /// The dispatch attempt failed.
    Failed,
}

/// Circuit-breaker state for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Probing after a cool-down.
    HalfOpen,
    /// Calls are short-circuited.
    Open,
}

/// One typed bus event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum BusEvent {
    /// A worker heartbeat changed (`worker:status`).
    #[serde(rename = "worker:status")]
    WorkerStatus {
        /// Worker identity.
        worker_id: String,
        /// New availability.
        status: WorkerStatus,
        /// Free-form detail, scrubbed before delivery.
        detail: Value,
    },

    /// A dispatch attempt progressed (`dispatch:lifecycle`).
    #[serde(rename = "dispatch:lifecycle")]
    DispatchLifecycle {
        /// Task being dispatched.
        task_id: String,
        /// Lifecycle phase.
        phase: DispatchPhase,
        /// Free-form detail, scrubbed before delivery.
        detail: Value,
    },

    /// A provider circuit breaker changed state (`breaker:state`).
    #[serde(rename = "breaker:state")]
    BreakerState {
        /// Provider the breaker guards.
        provider: String,
        /// New breaker state.
        state: BreakerState,
        /// Free-form detail, scrubbed before delivery.
        detail: Value,
    },

    /// A mention notification row was created (`notification:created`).
    #[serde(rename = "notification:created")]
    NotificationCreated {
        /// Task the comment belongs to.
        task_id: String,
        /// Mentioned group.
        target_group: String,
        /// Free-form detail, scrubbed before delivery.
        detail: Value,
    },

    /// A chat message row was written (`chat:message`).
    #[serde(rename = "chat:message")]
    ChatMessage {
        /// Owning group.
        group_folder: String,
        /// Free-form detail, scrubbed before delivery.
        detail: Value,
    },

    /// A task entered READY with an assigned group (`task:ready`).
    ///
    /// This is the dispatcher's pick-up signal.
    #[serde(rename = "task:ready")]
    TaskReady {
        /// The ready task.
        task_id: String,
        /// Group the dispatcher should hand it to.
        assigned_group: String,
    },
}

impl BusEvent {
    /// Scrubs the event's free-form payload in place.
    fn scrub(&mut self) {
        match self {
            Self::WorkerStatus { detail, .. }
            | Self::DispatchLifecycle { detail, .. }
            | Self::BreakerState { detail, .. }
            | Self::NotificationCreated { detail, .. }
            | Self::ChatMessage { detail, .. } => scrub_value(detail),
            Self::TaskReady { .. } => {}
        }
    }
}

/// The in-process bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus with the given per-subscriber buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event, scrubbing its payload first.
    ///
    /// Publishing with no subscribers is not an error; the event is
    /// simply dropped.
    pub fn publish(&self, mut event: BusEvent) {
        event.scrub();
        let _ = self.tx.send(event);
    }

    /// Subscribes to the bus.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Returns the current subscriber count.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

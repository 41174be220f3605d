//! Typed event bus connecting the task store, session registry, claim
//! coordinator, context tracker and rate-limit tracker to the control plane.
//!
//! Generalizes the orchestrator's internal `mpsc` result channel
//! (`agents/orchestrator/mod.rs` in the teacher) into a `broadcast` channel:
//! every subscriber gets its own receiver, and a slow subscriber only lags
//! or is dropped rather than ever blocking a producer.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{Phase, SessionStatus};

const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Event {
    Task(TaskEvent),
    Session(SessionEvent),
    Claim(ClaimEvent),
    Tracker(TrackerEvent),
    RateLimit(RateLimitEvent),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TaskEvent {
    Created { task_id: String },
    StatusChanged { task_id: String, status: String },
    Completed { task_id: String, quality_score: Option<u32> },
    Unblocked { task_id: String, unblocked_by: String },
    Promoted { task_id: String, from_tier: String, to_tier: String },
    Moved { task_id: String, tier: String },
    Deleted { task_id: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    Started { session_id: i64, project: String },
    Updated { session_id: i64, status: SessionStatus },
    Completed { session_id: i64 },
    DelegationStarted { session_id: i64, delegation_id: String },
    DelegationCompleted { session_id: i64, delegation_id: String },
    DelegationFailed { session_id: i64, delegation_id: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClaimEvent {
    Claimed { task_id: String, session_id: i64 },
    Released { task_id: String, session_id: i64 },
    CleanupExpired { count: usize },
    CleanupOrphaned { count: usize },
}

#[derive(Debug, Clone, Serialize)]
pub enum AlertLevel {
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TrackerEvent {
    Threshold {
        level: AlertLevel,
        project: String,
        project_path: String,
        session_id: Option<i64>,
        utilization: f64,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RateLimitEvent {
    AlertWarning { window: String, used_fraction: f64 },
    AlertCritical { window: String, used_fraction: f64 },
}

/// Shared handle for publishing events. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publishes an event. Never blocks; if there are no subscribers this
    /// is a no-op (mirrors the teacher's tolerant `let _ = sender.send(..)`
    /// pattern in `monitoring/mod.rs`'s shutdown signaling).
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn publish_phase_advanced(&self, task_id: &str, phase: Phase) {
        self.publish(Event::Task(TaskEvent::StatusChanged {
            task_id: task_id.to_string(),
            status: format!("phase:{}", phase.as_str()),
        }));
    }
}

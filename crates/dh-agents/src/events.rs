use dh_core::types::TaskStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskEvent
// ---------------------------------------------------------------------------

/// Progress reported while a task runs. Events for one task arrive in the
/// order the supervisor produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    StateChanged {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
    LogLine {
        task_id: Uuid,
        agent_id: String,
        line: String,
    },
    RetryScheduled {
        task_id: Uuid,
        /// Number of the attempt that will run after the delay.
        attempt: u32,
        agent_id: String,
        delay_ms: u64,
    },
    AgentSwitched {
        task_id: Uuid,
        from: String,
        to: String,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            TaskEvent::StateChanged { task_id, .. }
            | TaskEvent::LogLine { task_id, .. }
            | TaskEvent::RetryScheduled { task_id, .. }
            | TaskEvent::AgentSwitched { task_id, .. } => *task_id,
        }
    }
}

// ---------------------------------------------------------------------------
// EventSink
// ---------------------------------------------------------------------------

/// Where a supervisor delivers its progress events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TaskEvent);
}

/// Forward into a channel. A dropped receiver silently discards events.
impl EventSink for flume::Sender<TaskEvent> {
    fn emit(&self, event: TaskEvent) {
        if self.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }
}

/// Invoke a closure for every event.
pub struct CallbackSink<F>(F);

impl<F> CallbackSink<F>
where
    F: Fn(TaskEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self(callback)
    }
}

impl<F> EventSink for CallbackSink<F>
where
    F: Fn(TaskEvent) + Send + Sync,
{
    fn emit(&self, event: TaskEvent) {
        (self.0)(event)
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: TaskEvent) {}
}

use std::sync::Arc;

use dh_core::config::SupervisorConfig;
use dh_core::types::Task;
use dh_harness::stop::StopSignal;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::EventSink;
use crate::supervisor::{SupervisorError, TaskResult, TaskSupervisor};

/// Default maximum number of concurrent tasks when none is specified.
const DEFAULT_MAX_CONCURRENT: u32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("task worker failed: {0}")]
    Join(String),
}

/// Admission gate for concurrently running tasks.
///
/// Tasks beyond `max_concurrent` wait for a permit and do not start until
/// one frees up. A queued task that is stopped never launches a container.
pub struct TaskScheduler {
    concurrency_gate: Arc<Semaphore>,
    max_concurrent: u32,
}

/// Handle to a submitted task.
pub struct TaskHandle {
    pub task_id: Uuid,
    stop: StopSignal,
    join: JoinHandle<Result<(Task, TaskResult), SupervisorError>>,
}

impl TaskHandle {
    /// Request cancellation. Idempotent.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Wait for the task to finish; returns the final task and its result.
    pub async fn wait(self) -> Result<(Task, TaskResult), SchedulerError> {
        match self.join.await {
            Ok(result) => Ok(result?),
            Err(e) => Err(SchedulerError::Join(e.to_string())),
        }
    }
}

impl TaskScheduler {
    /// Create a new task scheduler with the given concurrency limit.
    pub fn new(max_concurrent: u32) -> Self {
        let limit = if max_concurrent == 0 {
            warn!("max_concurrent was 0, defaulting to {DEFAULT_MAX_CONCURRENT}");
            DEFAULT_MAX_CONCURRENT
        } else {
            max_concurrent
        };
        Self {
            concurrency_gate: Arc::new(Semaphore::new(limit as usize)),
            max_concurrent: limit,
        }
    }

    /// Returns the number of task slots currently available.
    pub fn available_slots(&self) -> usize {
        self.concurrency_gate.available_permits()
    }

    /// Returns the configured maximum concurrency.
    pub fn max_concurrent(&self) -> u32 {
        self.max_concurrent
    }

    /// Queue `task` and run it under `supervisor` once a slot is free.
    pub fn submit(
        &self,
        supervisor: Arc<TaskSupervisor>,
        mut task: Task,
        config: SupervisorConfig,
        events: Arc<dyn EventSink>,
    ) -> TaskHandle {
        let task_id = task.id;
        let stop = StopSignal::new();
        let gate = Arc::clone(&self.concurrency_gate);
        let worker_stop = stop.clone();

        let join = tokio::spawn(async move {
            // Held until the supervisor returns.
            let _permit = tokio::select! {
                permit = gate.acquire_owned() => permit.ok(),
                _ = worker_stop.stopped() => None,
            };
            debug!(task_id = %task_id, "task admitted");
            let result = supervisor
                .run(&mut task, &config, events.as_ref(), &worker_stop)
                .await?;
            Ok((task, result))
        });

        TaskHandle { task_id, stop, join }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

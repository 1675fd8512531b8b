use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dh_agents::events::NullSink;
use dh_agents::lifecycle::{AttemptExecutor, AttemptRequest, LogSink};
use dh_agents::scheduler::TaskScheduler;
use dh_agents::supervisor::TaskSupervisor;
use dh_core::artifacts::ArtifactStore;
use dh_core::config::{RateLimitConfig, SupervisorConfig};
use dh_core::cooldown::CooldownTracker;
use dh_core::types::{AgentChain, AgentInstance, AttemptResult, CliType, Task, TaskOutcome, TerminalReason};
use dh_harness::classifier::ErrorClassifier;
use dh_harness::stop::StopSignal;
use tokio::sync::Semaphore;

/// Holds every attempt open until released or stopped.
struct GatedExecutor {
    calls: AtomicUsize,
    release: Semaphore,
}

#[async_trait]
impl AttemptExecutor for GatedExecutor {
    async fn execute(&self, request: &AttemptRequest, _logs: &dyn LogSink, stop: &StopSignal) -> AttemptResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            permit = self.release.acquire() => {
                if let Ok(p) = permit {
                    p.forget();
                }
            }
            _ = stop.stopped() => {}
        }
        AttemptResult {
            agent_id: request.agent.id.clone(),
            cli: request.agent.cli,
            exit_code: 0,
            log_tail: Vec::new(),
            terminal_reason: TerminalReason::Normal,
            staged_files: Vec::new(),
            staging_dir: None,
            container_id: None,
            error: None,
        }
    }
}

fn setup() -> (tempfile::TempDir, Arc<GatedExecutor>, Arc<TaskSupervisor>) {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(GatedExecutor {
        calls: AtomicUsize::new(0),
        release: Semaphore::new(0),
    });
    let supervisor = TaskSupervisor::new(
        executor.clone(),
        ErrorClassifier::from_config(&RateLimitConfig::default()).unwrap(),
        Arc::new(CooldownTracker::in_memory()),
        ArtifactStore::new(dir.path().join("artifacts")),
    );
    (dir, executor, Arc::new(supervisor))
}

fn task() -> Task {
    let chain = AgentChain::new(vec![AgentInstance::new("claude", CliType::Claude, "/cfg")]);
    Task::new("do it", "web", "web-app", "/workspace", chain)
}

async fn wait_for_calls(executor: &GatedExecutor, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while executor.calls.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("executor reached");
}

#[test]
fn zero_concurrency_falls_back_to_default() {
    let scheduler = TaskScheduler::new(0);
    assert_eq!(scheduler.max_concurrent(), 4);
    assert_eq!(scheduler.available_slots(), 4);
    assert_eq!(TaskScheduler::default().max_concurrent(), 4);
}

#[tokio::test]
async fn tasks_beyond_limit_wait_for_a_slot() {
    let (_dir, executor, supervisor) = setup();
    let scheduler = TaskScheduler::new(1);

    let first = scheduler.submit(supervisor.clone(), task(), SupervisorConfig::immediate(0), Arc::new(NullSink));
    wait_for_calls(&executor, 1).await;
    let second = scheduler.submit(supervisor.clone(), task(), SupervisorConfig::immediate(0), Arc::new(NullSink));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.available_slots(), 0);

    executor.release.add_permits(2);
    let (_, r1) = first.wait().await.unwrap();
    let (t2, r2) = second.wait().await.unwrap();

    assert!(r1.succeeded());
    assert!(r2.succeeded());
    assert_eq!(r2.task_id, t2.id);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.available_slots(), 1);
}

#[tokio::test]
async fn stopping_queued_task_never_launches_it() {
    let (_dir, executor, supervisor) = setup();
    let scheduler = TaskScheduler::new(1);

    let running = scheduler.submit(supervisor.clone(), task(), SupervisorConfig::immediate(0), Arc::new(NullSink));
    wait_for_calls(&executor, 1).await;
    let queued = scheduler.submit(supervisor.clone(), task(), SupervisorConfig::immediate(0), Arc::new(NullSink));

    queued.stop();
    let (task, result) = queued.wait().await.unwrap();
    assert_eq!(result.outcome, TaskOutcome::Cancelled);
    assert_eq!(result.metadata.attempt_count, 0);
    assert!(task.status.is_terminal());
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

    running.stop();
    let (_, result) = running.wait().await.unwrap();
    assert_eq!(result.outcome, TaskOutcome::Cancelled);
}

//! Retry / fallback driver for a single task.
//!
//! The supervisor walks the task's agent chain, running one attempt at a
//! time through an [`AttemptExecutor`]. Each failed attempt is classified and
//! the category decides between retrying the same agent, switching to the
//! next one, or giving up.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dh_core::artifacts::ArtifactStore;
use dh_core::config::SupervisorConfig;
use dh_core::cooldown::CooldownTracker;
use dh_core::types::{AgentInstance, Artifact, AttemptResult, Task, TaskOutcome, TaskStatus};
use dh_harness::backoff::{backoff_for, FRESH_CONTAINER_DELAY};
use dh_harness::classifier::{ErrorClassifier, FailureCategory};
use dh_harness::stop::StopSignal;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::events::{EventSink, TaskEvent};
use crate::lifecycle::{discard_dir, AttemptExecutor, AttemptRequest, LogSink};
use crate::state_machine::{StateMachineError, SupervisorStateMachine};

/// Cooldown recorded for a rate limit with no retry-after hint.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Only raised when the supervisor itself misbehaves; every task-level failure
/// is reported through [`TaskResult`].
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("agent index {index} out of range for chain of {len}")]
    ChainIndex { index: usize, len: usize },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

// ---------------------------------------------------------------------------
// TaskResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunMetadata {
    /// Agent of the last attempt.
    pub agent_used: Option<String>,
    pub attempt_count: u32,
    pub fallback_count: u32,
    pub retry_count: u32,
    pub last_category: Option<FailureCategory>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub outcome: TaskOutcome,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub artifacts: Vec<Artifact>,
    pub metadata: RunMetadata,
}

impl TaskResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == TaskOutcome::Succeeded
    }
}

// ---------------------------------------------------------------------------
// TaskSupervisor
// ---------------------------------------------------------------------------

pub struct TaskSupervisor {
    executor: Arc<dyn AttemptExecutor>,
    classifier: ErrorClassifier,
    cooldowns: Arc<CooldownTracker>,
    artifacts: ArtifactStore,
    default_cooldown: Duration,
}

enum Next {
    Retry { delay: Duration },
    Switch { to: usize },
    Fail { error: String },
}

impl TaskSupervisor {
    pub fn new(
        executor: Arc<dyn AttemptExecutor>,
        classifier: ErrorClassifier,
        cooldowns: Arc<CooldownTracker>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            executor,
            classifier,
            cooldowns,
            artifacts,
            default_cooldown: DEFAULT_COOLDOWN,
        }
    }

    pub fn with_default_cooldown(mut self, cooldown: Duration) -> Self {
        self.default_cooldown = cooldown;
        self
    }

    pub fn cooldowns(&self) -> &Arc<CooldownTracker> {
        &self.cooldowns
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Drive `task` to a completed state.
    ///
    /// Attempts run strictly one after another. A stop request is honoured
    /// between attempts and during backoff; during an attempt it is passed to
    /// the executor, and the task always ends as cancelled.
    pub async fn run(
        &self,
        task: &mut Task,
        config: &SupervisorConfig,
        events: &dyn EventSink,
        stop: &StopSignal,
    ) -> Result<TaskResult> {
        let mut run = Run::new(task, events);
        run.task.started_at = Some(Utc::now());
        run.task.status = TaskStatus::Initialize;
        run.task.retry_counts = run.task.chain.iter().map(|a| (a.id.clone(), 0)).collect();
        info!(
            task_id = %run.task.id,
            environment = %run.task.environment_id,
            agents = run.task.chain.len(),
            "task started"
        );

        if run.task.chain.is_empty() {
            return run.fail(TaskOutcome::Failed, "no agents available for this environment".into());
        }

        let mut index = 0usize;
        let mut fresh_relaunch_used = false;

        loop {
            if stop.is_stopped() {
                return run.fail(TaskOutcome::Cancelled, "cancelled".into());
            }
            run.enter(TaskStatus::Launch)?;

            let len = run.task.chain.len();
            let agent: AgentInstance = run
                .task
                .chain
                .get(index)
                .cloned()
                .ok_or(SupervisorError::ChainIndex { index, len })?;
            run.meta.attempt_count += 1;
            run.meta.agent_used = Some(agent.id.clone());

            let request = AttemptRequest {
                task_id: run.task.id,
                attempt: run.meta.attempt_count,
                agent: agent.clone(),
                prompt: run.task.prompt.clone(),
                environment_id: run.task.environment_id.clone(),
                workdir: run.task.workdir.clone(),
                branch: run.task.branch.clone(),
            };

            run.enter(TaskStatus::Running)?;
            let result = {
                let logs = AttemptLogs {
                    events: run.events,
                    task_id: run.task.id,
                    agent_id: &agent.id,
                };
                self.executor.execute(&request, &logs, stop).await
            };
            run.enter(TaskStatus::DetectExit)?;
            run.task.exit_code = Some(result.exit_code);

            if stop.is_stopped() {
                discard_staging(&result);
                return run.fail(TaskOutcome::Cancelled, "cancelled".into());
            }

            if result.succeeded() {
                run.enter(TaskStatus::Success)?;
                let artifacts = self.persist_artifacts(run.task, &result).await;
                if let Err(e) = self.cooldowns.mark_available(agent.cli) {
                    warn!(agent = %agent.cli, error = %e, "failed to persist agent availability");
                }
                return run.succeed(artifacts);
            }

            run.enter(TaskStatus::ClassifyError)?;
            let category = self.classifier.classify(
                result.cli,
                result.exit_code,
                result.terminal_reason,
                &result.log_tail,
            );
            run.meta.last_category = Some(category);
            discard_staging(&result);
            warn!(
                task_id = %run.task.id,
                agent = %agent.id,
                attempt = run.meta.attempt_count,
                exit_code = result.exit_code,
                category = %category,
                "attempt failed"
            );

            self.record_side_effects(&agent, &category, &result);

            let next = if category == FailureCategory::Fatal {
                Next::Fail {
                    error: describe_failure(&agent, &category, &result),
                }
            } else if category == FailureCategory::ContainerCrash && !fresh_relaunch_used {
                fresh_relaunch_used = true;
                info!(task_id = %run.task.id, agent = %agent.id, "relaunching in a fresh container");
                Next::Retry {
                    delay: FRESH_CONTAINER_DELAY,
                }
            } else {
                let used = run.task.retries_for(&agent.id);
                if used < config.max_retries_per_agent {
                    run.task.retry_counts.insert(agent.id.clone(), used + 1);
                    run.meta.retry_count += 1;
                    Next::Retry {
                        delay: backoff_for(config, used, &category),
                    }
                } else if config.fallback_enabled && index + 1 < len {
                    Next::Switch { to: index + 1 }
                } else {
                    Next::Fail {
                        error: format!(
                            "all agents exhausted after {} attempts; {}",
                            run.meta.attempt_count,
                            describe_failure(&agent, &category, &result)
                        ),
                    }
                }
            };

            match next {
                Next::Fail { error } => return run.fail(TaskOutcome::Failed, error),
                Next::Retry { delay } => {
                    run.enter(TaskStatus::Retry)?;
                    let delay_ms: u64 = delay.as_millis().try_into().unwrap_or(u64::MAX);
                    run.events.emit(TaskEvent::RetryScheduled {
                        task_id: run.task.id,
                        attempt: run.meta.attempt_count + 1,
                        agent_id: agent.id.clone(),
                        delay_ms,
                    });
                    debug!(task_id = %run.task.id, agent = %agent.id, delay_ms, "backing off");
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = stop.stopped() => {}
                        }
                    }
                }
                Next::Switch { to } => {
                    run.enter(TaskStatus::SwitchAgent)?;
                    let next_agent = run
                        .task
                        .chain
                        .get(to)
                        .map(|a| a.id.clone())
                        .ok_or(SupervisorError::ChainIndex { index: to, len })?;
                    run.task.retry_counts.insert(next_agent.clone(), 0);
                    run.meta.fallback_count += 1;
                    index = to;
                    fresh_relaunch_used = false;
                    info!(task_id = %run.task.id, from = %agent.id, to = %next_agent, "switching agent");
                    run.events.emit(TaskEvent::AgentSwitched {
                        task_id: run.task.id,
                        from: agent.id.clone(),
                        to: next_agent,
                    });
                }
            }
        }
    }

    /// Cooldown ledger updates implied by a failure category. Persist
    /// failures are logged; they never fail the task.
    fn record_side_effects(&self, agent: &AgentInstance, category: &FailureCategory, result: &AttemptResult) {
        match category {
            FailureCategory::RateLimit { retry_after } => {
                let duration = retry_after.unwrap_or(self.default_cooldown);
                let reason = match result.summary_line() {
                    Some(line) => format!("exit {}: {}", result.exit_code, line),
                    None => format!("exit {}", result.exit_code),
                };
                if let Err(e) = self.cooldowns.record_rate_limit(agent.cli, duration, reason) {
                    warn!(agent = %agent.cli, error = %e, "failed to persist cooldown");
                }
            }
            FailureCategory::AgentFailure => {
                let reason = format!("{} exited {}", agent.cli, result.exit_code);
                if let Err(e) = self.cooldowns.mark_unavailable(agent.cli, reason) {
                    warn!(agent = %agent.cli, error = %e, "failed to persist agent status");
                }
            }
            _ => {}
        }
    }

    /// Encrypt the successful attempt's staged files, then drop whatever is
    /// left of its staging directory. Files that could not be stored stay.
    async fn persist_artifacts(&self, task: &mut Task, result: &AttemptResult) -> Vec<Artifact> {
        if result.staged_files.is_empty() {
            discard_staging(result);
            return Vec::new();
        }

        let store = self.artifacts.clone();
        let files = result.staged_files.clone();
        let task_id = task.id;
        let environment = task.environment_name.clone();
        let stored = match tokio::task::spawn_blocking(move || store.store(task_id, &environment, &files)).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "artifact store panicked, plaintext left in staging");
                return Vec::new();
            }
        };

        if let Some(dir) = &result.staging_dir {
            prune_empty_dirs(dir);
        }
        task.artifacts.extend(stored.iter().map(|a| a.id));
        stored
    }
}

// ---------------------------------------------------------------------------
// Per-run bookkeeping
// ---------------------------------------------------------------------------

struct Run<'a> {
    task: &'a mut Task,
    events: &'a dyn EventSink,
    sm: SupervisorStateMachine,
    meta: RunMetadata,
}

impl<'a> Run<'a> {
    fn new(task: &'a mut Task, events: &'a dyn EventSink) -> Self {
        Self {
            task,
            events,
            sm: SupervisorStateMachine::new(),
            meta: RunMetadata::default(),
        }
    }

    fn enter(&mut self, to: TaskStatus) -> Result<()> {
        let from = self.sm.state();
        self.sm.transition(to)?;
        self.task.status = to;
        self.events.emit(TaskEvent::StateChanged {
            task_id: self.task.id,
            from,
            to,
        });
        Ok(())
    }

    fn succeed(mut self, artifacts: Vec<Artifact>) -> Result<TaskResult> {
        self.enter(TaskStatus::Completed(TaskOutcome::Succeeded))?;
        self.task.error = None;
        self.task.completed_at = Some(Utc::now());
        info!(
            task_id = %self.task.id,
            attempts = self.meta.attempt_count,
            artifacts = artifacts.len(),
            "task succeeded"
        );
        Ok(TaskResult {
            task_id: self.task.id,
            outcome: TaskOutcome::Succeeded,
            exit_code: self.task.exit_code,
            error: None,
            artifacts,
            metadata: self.meta,
        })
    }

    fn fail(mut self, outcome: TaskOutcome, error: String) -> Result<TaskResult> {
        self.enter(TaskStatus::TerminalFail)?;
        self.enter(TaskStatus::Completed(outcome))?;
        self.task.error = Some(error.clone());
        self.task.completed_at = Some(Utc::now());
        warn!(
            task_id = %self.task.id,
            outcome = %outcome,
            attempts = self.meta.attempt_count,
            fallbacks = self.meta.fallback_count,
            error = %error,
            "task did not succeed"
        );
        Ok(TaskResult {
            task_id: self.task.id,
            outcome,
            exit_code: self.task.exit_code,
            error: Some(error),
            artifacts: Vec::new(),
            metadata: self.meta,
        })
    }
}

/// Bridges container output into the task's event stream.
struct AttemptLogs<'a> {
    events: &'a dyn EventSink,
    task_id: Uuid,
    agent_id: &'a str,
}

impl LogSink for AttemptLogs<'_> {
    fn send_line(&self, line: &str) {
        self.events.emit(TaskEvent::LogLine {
            task_id: self.task_id,
            agent_id: self.agent_id.to_string(),
            line: line.to_string(),
        });
    }
}

fn describe_failure(agent: &AgentInstance, category: &FailureCategory, result: &AttemptResult) -> String {
    let mut text = format!("{} failed ({category}, exit {})", agent.id, result.exit_code);
    if let Some(line) = result.summary_line() {
        text.push_str(": ");
        text.push_str(line);
    }
    text
}

fn discard_staging(result: &AttemptResult) {
    if let Some(dir) = &result.staging_dir {
        discard_dir(dir);
        if let Some(parent) = dir.parent() {
            // Succeeds only once no other attempt directory remains.
            let _ = std::fs::remove_dir(parent);
        }
    }
}

fn prune_empty_dirs(root: &Path) {
    for entry in WalkDir::new(root).contents_first(true).into_iter().flatten() {
        if entry.file_type().is_dir() {
            let _ = std::fs::remove_dir(entry.path());
        }
    }
    if let Some(parent) = root.parent() {
        let _ = std::fs::remove_dir(parent);
    }
}

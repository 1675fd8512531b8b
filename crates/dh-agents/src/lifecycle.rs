//! One attempt: one agent CLI, one container, one exit code.
//!
//! [`ContainerLifecycle`] builds the container invocation, starts it, streams
//! its output while watching for a terminal state, then collects whatever the
//! agent left in its staging directory. Failures never escape as errors; they
//! come back as a populated [`AttemptResult`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dh_core::config::{ContainerConfig, EnvironmentConfig, Mount};
use dh_core::types::{AgentInstance, AttemptResult, CliType, StagedFile, TerminalReason};
use dh_harness::stop::StopSignal;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::cli;
use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerState};

pub const WORKSPACE_MOUNT: &str = "/workspace";
pub const ARTIFACT_MOUNT: &str = "/artifacts";
pub const PREFLIGHT_MOUNT: &str = "/dockhand/preflight.sh";

// ---------------------------------------------------------------------------
// Request / sinks
// ---------------------------------------------------------------------------

/// Inputs for a single attempt.
#[derive(Debug, Clone)]
pub struct AttemptRequest {
    pub task_id: Uuid,
    /// 1-based attempt number within the task.
    pub attempt: u32,
    pub agent: AgentInstance,
    pub prompt: String,
    pub environment_id: String,
    pub workdir: PathBuf,
    pub branch: Option<String>,
}

/// Receives container output line by line as it is produced.
pub trait LogSink: Send + Sync {
    fn send_line(&self, line: &str);
}

/// Runs one attempt to completion.
#[async_trait]
pub trait AttemptExecutor: Send + Sync {
    /// Never fails: launch problems are reported through the result with
    /// [`TerminalReason::LaunchFailed`].
    async fn execute(&self, request: &AttemptRequest, logs: &dyn LogSink, stop: &StopSignal) -> AttemptResult;
}

// ---------------------------------------------------------------------------
// Launch errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("unknown environment '{0}'")]
    UnknownEnvironment(String),

    #[error("no container image configured for {0}")]
    NoImage(CliType),

    #[error("{what} does not exist: {path}")]
    MissingPath { what: &'static str, path: PathBuf },

    #[error("cannot quote command: {0}")]
    Quote(String),

    #[error("staging setup failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully built invocation plus the host paths it owns.
#[derive(Debug)]
struct Prepared {
    spec: ContainerSpec,
    staging_dir: PathBuf,
    preflight_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// ContainerLifecycle
// ---------------------------------------------------------------------------

pub struct ContainerLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    config: ContainerConfig,
    environments: HashMap<String, EnvironmentConfig>,
    staging_root: PathBuf,
}

impl ContainerLifecycle {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: ContainerConfig,
        environments: HashMap<String, EnvironmentConfig>,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            config,
            environments,
            staging_root: staging_root.into(),
        }
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Private staging directory for one attempt of one task.
    pub fn staging_dir_for(&self, task_id: Uuid, attempt: u32) -> PathBuf {
        self.staging_root
            .join(task_id.to_string())
            .join(format!("attempt-{attempt}"))
    }

    fn prepare(&self, request: &AttemptRequest) -> Result<Prepared, LaunchError> {
        let env = self
            .environments
            .get(&request.environment_id)
            .ok_or_else(|| LaunchError::UnknownEnvironment(request.environment_id.clone()))?;
        let agent = &request.agent;
        let template = cli::for_cli(agent.cli);
        let image = self
            .config
            .image_for(agent.cli)
            .ok_or(LaunchError::NoImage(agent.cli))?;

        require_dir("workspace", &request.workdir)?;
        require_dir("agent config directory", &agent.config_dir)?;

        let argv = template.build_command(agent, &request.prompt);
        let agent_cmd = shlex::try_join(argv.iter().map(String::as_str))
            .map_err(|e| LaunchError::Quote(e.to_string()))?;

        let staging_dir = self.staging_dir_for(request.task_id, request.attempt);
        create_private_dir(&staging_dir)?;

        let mut mounts = vec![
            Mount {
                host: agent.config_dir.clone(),
                container: template.config_mount_target().to_string(),
                read_only: false,
            },
            Mount {
                host: request.workdir.clone(),
                container: WORKSPACE_MOUNT.to_string(),
                read_only: false,
            },
            Mount {
                host: staging_dir.clone(),
                container: ARTIFACT_MOUNT.to_string(),
                read_only: false,
            },
        ];
        mounts.extend(env.mounts.iter().cloned());

        let mut preflight_path = None;
        let script = match env.preflight_script.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(body) => {
                // Kept beside, not inside, the staging dir so it is never
                // collected as an artifact.
                let path = staging_dir.with_extension("preflight.sh");
                if let Err(e) = std::fs::write(&path, body) {
                    discard_dir(&staging_dir);
                    return Err(e.into());
                }
                mounts.push(Mount {
                    host: path.clone(),
                    container: PREFLIGHT_MOUNT.to_string(),
                    read_only: true,
                });
                preflight_path = Some(path);
                format!(
                    "sh {PREFLIGHT_MOUNT} || echo \"dockhand: preflight failed with exit $?, continuing\" >&2; exec {agent_cmd}"
                )
            }
            None => format!("exec {agent_cmd}"),
        };

        let mut env_vars: BTreeMap<String, String> = env.env.clone();
        env_vars.insert("DOCKHAND_TASK_ID".into(), request.task_id.to_string());
        env_vars.insert("DOCKHAND_ATTEMPT".into(), request.attempt.to_string());
        env_vars.insert("DOCKHAND_ARTIFACT_DIR".into(), ARTIFACT_MOUNT.into());
        if let Some(branch) = &request.branch {
            env_vars.insert("DOCKHAND_BRANCH".into(), branch.clone());
        }

        let mut labels = BTreeMap::new();
        labels.insert("dockhand.task_id".to_string(), request.task_id.to_string());
        labels.insert("dockhand.agent".to_string(), agent.id.clone());

        let spec = ContainerSpec {
            name: format!("dockhand-{}-{}", request.task_id.simple(), request.attempt),
            image: image.to_string(),
            mounts,
            env: env_vars,
            labels,
            workdir: WORKSPACE_MOUNT.to_string(),
            command: vec!["sh".into(), "-c".into(), script],
        };

        Ok(Prepared {
            spec,
            staging_dir,
            preflight_path,
        })
    }

    /// Stream output and poll for a terminal state until the container stops.
    async fn supervise(
        &self,
        container_id: &str,
        mut log_rx: Option<flume::Receiver<String>>,
        tail: &mut LogTail,
        logs: &dyn LogSink,
        stop: &StopSignal,
    ) -> (Result<ContainerState, String>, bool) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut killed = false;

        let outcome = loop {
            tokio::select! {
                line = next_line(&log_rx) => match line {
                    Some(line) => {
                        logs.send_line(&line);
                        tail.push(line);
                    }
                    None => log_rx = None,
                },
                _ = ticker.tick() => match self.runtime.inspect(container_id).await {
                    Ok(state) if !state.running => break Ok(state),
                    Ok(_) => {}
                    Err(e) => break Err(e.to_string()),
                },
                _ = stop.stopped(), if !killed => {
                    killed = true;
                    info!(container_id, "stop requested, killing container");
                    if let Err(e) = self.runtime.kill(container_id).await {
                        warn!(container_id, error = %e, "kill failed");
                    }
                }
            }
        };

        match (&outcome, log_rx) {
            // The follower ends at container exit; read everything it still holds.
            (Ok(_), Some(rx)) => {
                while let Ok(line) = rx.recv_async().await {
                    logs.send_line(&line);
                    tail.push(line);
                }
            }
            (Err(_), Some(rx)) => {
                for line in rx.drain() {
                    logs.send_line(&line);
                    tail.push(line);
                }
            }
            (_, None) => {}
        }

        (outcome, killed)
    }
}

#[async_trait]
impl AttemptExecutor for ContainerLifecycle {
    async fn execute(&self, request: &AttemptRequest, logs: &dyn LogSink, stop: &StopSignal) -> AttemptResult {
        let agent = &request.agent;
        let prepared = match self.prepare(request) {
            Ok(p) => p,
            Err(e) => {
                warn!(task_id = %request.task_id, agent = %agent.id, error = %e, "could not build container invocation");
                return AttemptResult::launch_failure(agent, e.to_string());
            }
        };

        let container_id = match self.runtime.start(&prepared.spec).await {
            Ok(id) => id,
            Err(e) => {
                warn!(task_id = %request.task_id, agent = %agent.id, error = %e, "container engine failed to start attempt");
                discard_dir(&prepared.staging_dir);
                remove_file_quiet(prepared.preflight_path.as_deref());
                return AttemptResult::launch_failure(agent, e.to_string());
            }
        };
        info!(
            task_id = %request.task_id,
            attempt = request.attempt,
            agent = %agent.id,
            container_id = %container_id,
            "container started"
        );

        let log_rx = match self.runtime.logs(&container_id).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "log stream unavailable, polling only");
                None
            }
        };

        let mut tail = LogTail::new(self.config.log_tail_lines);
        let (outcome, killed) = self
            .supervise(&container_id, log_rx, &mut tail, logs, stop)
            .await;

        let (exit_code, terminal_reason, error) = match outcome {
            Ok(state) => {
                let reason = if state.oom_killed {
                    TerminalReason::OutOfMemory
                } else if killed {
                    TerminalReason::Killed
                } else {
                    TerminalReason::Normal
                };
                (state.exit_code.unwrap_or(1), reason, None)
            }
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "lost track of container state");
                (1, TerminalReason::Normal, Some(format!("container inspect failed: {e}")))
            }
        };

        let staged_files = collect_staged(&prepared.staging_dir);
        remove_file_quiet(prepared.preflight_path.as_deref());

        if self.config.auto_remove {
            if let Err(e) = self.runtime.remove(&container_id).await {
                warn!(container_id = %container_id, error = %e, "failed to remove container");
            }
        }

        debug!(
            task_id = %request.task_id,
            exit_code,
            reason = ?terminal_reason,
            staged = staged_files.len(),
            "attempt finished"
        );

        AttemptResult {
            agent_id: agent.id.clone(),
            cli: agent.cli,
            exit_code,
            log_tail: tail.into_vec(),
            terminal_reason,
            staged_files,
            staging_dir: Some(prepared.staging_dir),
            container_id: Some(container_id),
            error,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn next_line(rx: &Option<flume::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv_async().await.ok(),
        None => std::future::pending().await,
    }
}

/// Bounded ring of the most recent output lines.
#[derive(Debug)]
pub struct LogTail {
    lines: VecDeque<String>,
    cap: usize,
}

impl LogTail {
    pub fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(cap.min(1024)),
            cap,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.cap == 0 {
            return;
        }
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn into_vec(self) -> Vec<String> {
        self.lines.into()
    }
}

fn require_dir(what: &'static str, path: &Path) -> Result<(), LaunchError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(LaunchError::MissingPath {
            what,
            path: path.to_path_buf(),
        })
    }
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Every regular file under `dir`. Symlinks are not followed.
pub fn collect_staged(dir: &Path) -> Vec<StagedFile> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable staging entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let relative_path = entry
            .path()
            .strip_prefix(dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(entry.file_name()));
        files.push(StagedFile {
            path: entry.path().to_path_buf(),
            relative_path,
            size_bytes,
        });
    }
    files
}

/// Remove a staging directory and everything in it.
pub fn discard_dir(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to discard staging directory"),
    }
}

fn remove_file_quiet(path: Option<&Path>) {
    if let Some(path) = path {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_tail_keeps_most_recent() {
        let mut tail = LogTail::new(3);
        for i in 0..5 {
            tail.push(format!("{i}"));
        }
        assert_eq!(tail.into_vec(), vec!["2", "3", "4"]);
    }

    #[test]
    fn zero_capacity_tail_keeps_nothing() {
        let mut tail = LogTail::new(0);
        tail.push("x".into());
        assert!(tail.into_vec().is_empty());
    }

    #[test]
    fn collect_staged_walks_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"aa").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"bbb").unwrap();

        let files = collect_staged(dir.path());
        let names: Vec<_> = files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt", "sub/b.txt"]);
        assert_eq!(files[1].size_bytes, 3);
    }

    #[test]
    fn collect_staged_on_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_staged(&dir.path().join("absent")).is_empty());
    }
}

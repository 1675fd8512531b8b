use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dh_agents::lifecycle::{
    AttemptExecutor, AttemptRequest, ContainerLifecycle, LogSink, ARTIFACT_MOUNT, PREFLIGHT_MOUNT,
    WORKSPACE_MOUNT,
};
use dh_agents::runtime::{ContainerRuntime, ContainerSpec, ContainerState, Result, RuntimeError};
use dh_core::config::{ContainerConfig, EnvironmentConfig};
use dh_core::types::{AgentInstance, CliType, TerminalReason};
use dh_harness::stop::StopSignal;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Fake container engine
// ---------------------------------------------------------------------------

struct FakeRuntime {
    lines: Vec<String>,
    final_state: ContainerState,
    /// Report `running` until killed.
    run_until_killed: bool,
    fail_start: bool,
    fail_inspect: bool,
    /// Files the "agent" writes into its artifact mount.
    files: Vec<(String, Vec<u8>)>,

    started: Mutex<Vec<ContainerSpec>>,
    log_tx: Mutex<Option<flume::Sender<String>>>,
    killed: AtomicBool,
    kill_calls: AtomicUsize,
    removed: Mutex<Vec<String>>,
}

impl FakeRuntime {
    fn exiting(code: i32, lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            final_state: ContainerState::exited(code),
            run_until_killed: false,
            fail_start: false,
            fail_inspect: false,
            files: Vec::new(),
            started: Mutex::new(Vec::new()),
            log_tx: Mutex::new(None),
            killed: AtomicBool::new(false),
            kill_calls: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
        }
    }

    fn last_spec(&self) -> ContainerSpec {
        self.started.lock().unwrap().last().cloned().expect("container started")
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<String> {
        if self.fail_start {
            return Err(RuntimeError::Command {
                engine: "docker".into(),
                command: "run".into(),
                stderr: "Unable to find image".into(),
            });
        }
        if let Some(mount) = spec.mounts.iter().find(|m| m.container == ARTIFACT_MOUNT) {
            for (name, body) in &self.files {
                std::fs::write(mount.host.join(name), body).unwrap();
            }
        }
        self.started.lock().unwrap().push(spec.clone());
        Ok(format!("ctr-{}", spec.name))
    }

    async fn logs(&self, _container_id: &str) -> Result<flume::Receiver<String>> {
        let (tx, rx) = flume::unbounded();
        for line in &self.lines {
            tx.send(line.clone()).unwrap();
        }
        if self.run_until_killed {
            *self.log_tx.lock().unwrap() = Some(tx);
        }
        Ok(rx)
    }

    async fn inspect(&self, _container_id: &str) -> Result<ContainerState> {
        if self.fail_inspect {
            return Err(RuntimeError::Parse("no such container".into()));
        }
        if self.run_until_killed && !self.killed.load(Ordering::SeqCst) {
            return Ok(ContainerState {
                running: true,
                exit_code: None,
                oom_killed: false,
            });
        }
        Ok(self.final_state)
    }

    async fn kill(&self, _container_id: &str) -> Result<()> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.killed.store(true, Ordering::SeqCst);
        self.log_tx.lock().unwrap().take();
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.removed.lock().unwrap().push(container_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct CollectedLines(Mutex<Vec<String>>);

impl LogSink for CollectedLines {
    fn send_line(&self, line: &str) {
        self.0.lock().unwrap().push(line.to_string());
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Fixture {
    dir: tempfile::TempDir,
    workdir: PathBuf,
    config_dir: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("repo");
        let config_dir = dir.path().join("claude-config");
        std::fs::create_dir_all(&workdir).unwrap();
        std::fs::create_dir_all(&config_dir).unwrap();
        Self {
            dir,
            workdir,
            config_dir,
        }
    }

    fn lifecycle(&self, runtime: Arc<FakeRuntime>, env: EnvironmentConfig) -> ContainerLifecycle {
        let config = ContainerConfig {
            poll_interval_ms: 10,
            ..ContainerConfig::default()
        };
        let mut envs = HashMap::new();
        envs.insert("web".to_string(), env);
        ContainerLifecycle::new(runtime, config, envs, self.dir.path().join("staging"))
    }

    fn request(&self, prompt: &str) -> AttemptRequest {
        AttemptRequest {
            task_id: Uuid::new_v4(),
            attempt: 1,
            agent: AgentInstance::new("claude", CliType::Claude, &self.config_dir),
            prompt: prompt.to_string(),
            environment_id: "web".into(),
            workdir: self.workdir.clone(),
            branch: Some("feature/login".into()),
        }
    }
}

fn env() -> EnvironmentConfig {
    EnvironmentConfig::new("web-app", "claude")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_exit_streams_logs_and_collects_artifacts() {
    let fx = Fixture::new();
    let runtime = Arc::new(FakeRuntime {
        files: vec![("report.md".into(), b"all green".to_vec())],
        ..FakeRuntime::exiting(0, &["starting", "done"])
    });
    let lifecycle = fx.lifecycle(runtime.clone(), env());
    let request = fx.request("add a login page");
    let sink = CollectedLines::default();

    let result = lifecycle.execute(&request, &sink, &StopSignal::new()).await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.terminal_reason, TerminalReason::Normal);
    assert!(result.succeeded());
    assert_eq!(result.log_tail, vec!["starting", "done"]);
    assert_eq!(*sink.0.lock().unwrap(), vec!["starting", "done"]);

    assert_eq!(result.staged_files.len(), 1);
    assert_eq!(result.staged_files[0].relative_path, PathBuf::from("report.md"));
    assert_eq!(result.staged_files[0].size_bytes, 9);
    assert_eq!(
        result.staging_dir.as_deref(),
        Some(lifecycle.staging_dir_for(request.task_id, 1).as_path())
    );

    // auto_remove is on by default
    assert_eq!(runtime.removed.lock().unwrap().len(), 1);
    assert_eq!(runtime.kill_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn container_spec_wires_mounts_env_and_command() {
    let fx = Fixture::new();
    let runtime = Arc::new(FakeRuntime::exiting(0, &[]));
    let mut environment = env();
    environment.env.insert("NODE_ENV".into(), "test".into());
    let lifecycle = fx.lifecycle(runtime.clone(), environment);
    let request = fx.request("fix the user's bug");

    lifecycle
        .execute(&request, &CollectedLines::default(), &StopSignal::new())
        .await;

    let spec = runtime.last_spec();
    assert_eq!(spec.image, "dockhand/claude:latest");
    assert_eq!(spec.workdir, WORKSPACE_MOUNT);
    assert_eq!(spec.name, format!("dockhand-{}-1", request.task_id.simple()));

    let targets: Vec<_> = spec.mounts.iter().map(|m| m.container.as_str()).collect();
    assert_eq!(targets, vec!["/root/.claude", WORKSPACE_MOUNT, ARTIFACT_MOUNT]);
    assert_eq!(spec.mounts[1].host, fx.workdir);

    assert_eq!(spec.env["DOCKHAND_TASK_ID"], request.task_id.to_string());
    assert_eq!(spec.env["DOCKHAND_ATTEMPT"], "1");
    assert_eq!(spec.env["DOCKHAND_BRANCH"], "feature/login");
    assert_eq!(spec.env["NODE_ENV"], "test");
    assert_eq!(spec.labels["dockhand.agent"], "claude");

    assert_eq!(&spec.command[..2], &["sh".to_string(), "-c".to_string()]);
    let script = &spec.command[2];
    assert!(script.starts_with("exec claude "), "{script}");
    // The prompt survives shell quoting as a single word.
    let words = shlex::split(script.trim_start_matches("exec ")).unwrap();
    assert_eq!(words.last().map(String::as_str), Some("fix the user's bug"));
}

#[tokio::test]
async fn preflight_script_runs_first_and_is_cleaned_up() {
    let fx = Fixture::new();
    let runtime = Arc::new(FakeRuntime::exiting(0, &[]));
    let mut environment = env();
    environment.preflight_script = Some("npm ci\n".into());
    let lifecycle = fx.lifecycle(runtime.clone(), environment);
    let request = fx.request("go");

    let result = lifecycle
        .execute(&request, &CollectedLines::default(), &StopSignal::new())
        .await;

    let spec = runtime.last_spec();
    let preflight = spec
        .mounts
        .iter()
        .find(|m| m.container == PREFLIGHT_MOUNT)
        .expect("preflight mounted");
    assert!(preflight.read_only);
    assert!(spec.command[2].starts_with("sh /dockhand/preflight.sh ||"));
    assert!(spec.command[2].contains("; exec claude"));

    assert!(!preflight.host.exists());
    // never collected as an artifact
    assert!(result.staged_files.is_empty());
}

#[tokio::test]
async fn oom_kill_is_reported() {
    let fx = Fixture::new();
    let runtime = Arc::new(FakeRuntime {
        final_state: ContainerState {
            running: false,
            exit_code: Some(137),
            oom_killed: true,
        },
        ..FakeRuntime::exiting(137, &["allocating"])
    });
    let lifecycle = fx.lifecycle(runtime, env());

    let result = lifecycle
        .execute(&fx.request("go"), &CollectedLines::default(), &StopSignal::new())
        .await;

    assert_eq!(result.exit_code, 137);
    assert_eq!(result.terminal_reason, TerminalReason::OutOfMemory);
}

#[tokio::test]
async fn stop_kills_running_container_once() {
    let fx = Fixture::new();
    let runtime = Arc::new(FakeRuntime {
        run_until_killed: true,
        ..FakeRuntime::exiting(137, &["working"])
    });
    let lifecycle = Arc::new(fx.lifecycle(runtime.clone(), env()));
    let request = fx.request("go");
    let stop = StopSignal::new();

    let handle = {
        let lifecycle = lifecycle.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let sink = CollectedLines::default();
            lifecycle.execute(&request, &sink, &stop).await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.trigger();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("attempt ended after stop")
        .unwrap();

    assert_eq!(runtime.kill_calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.exit_code, 137);
    assert_eq!(result.terminal_reason, TerminalReason::Killed);
    assert_eq!(result.log_tail, vec!["working"]);
}

#[tokio::test]
async fn engine_start_failure_is_launch_failure() {
    let fx = Fixture::new();
    let runtime = Arc::new(FakeRuntime {
        fail_start: true,
        ..FakeRuntime::exiting(0, &[])
    });
    let lifecycle = fx.lifecycle(runtime, env());
    let request = fx.request("go");

    let result = lifecycle
        .execute(&request, &CollectedLines::default(), &StopSignal::new())
        .await;

    assert_eq!(result.terminal_reason, TerminalReason::LaunchFailed);
    assert!(!result.succeeded());
    assert!(result.error.unwrap().contains("Unable to find image"));
    assert!(!lifecycle.staging_dir_for(request.task_id, 1).exists());
}

#[tokio::test]
async fn unknown_environment_never_starts_a_container() {
    let fx = Fixture::new();
    let runtime = Arc::new(FakeRuntime::exiting(0, &[]));
    let lifecycle = fx.lifecycle(runtime.clone(), env());
    let mut request = fx.request("go");
    request.environment_id = "missing".into();

    let result = lifecycle
        .execute(&request, &CollectedLines::default(), &StopSignal::new())
        .await;

    assert_eq!(result.terminal_reason, TerminalReason::LaunchFailed);
    assert!(runtime.started.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_workdir_is_launch_failure() {
    let fx = Fixture::new();
    let runtime = Arc::new(FakeRuntime::exiting(0, &[]));
    let lifecycle = fx.lifecycle(runtime.clone(), env());
    let mut request = fx.request("go");
    request.workdir = fx.dir.path().join("not-cloned");

    let result = lifecycle
        .execute(&request, &CollectedLines::default(), &StopSignal::new())
        .await;

    assert_eq!(result.terminal_reason, TerminalReason::LaunchFailed);
    assert!(result.error.unwrap().contains("workspace"));
    assert!(runtime.started.lock().unwrap().is_empty());
}

#[tokio::test]
async fn lost_container_reports_failure() {
    let fx = Fixture::new();
    let runtime = Arc::new(FakeRuntime {
        fail_inspect: true,
        ..FakeRuntime::exiting(0, &[])
    });
    let lifecycle = fx.lifecycle(runtime, env());

    let result = lifecycle
        .execute(&fx.request("go"), &CollectedLines::default(), &StopSignal::new())
        .await;

    assert_eq!(result.exit_code, 1);
    assert!(result.error.unwrap().contains("inspect"));
}

#[tokio::test]
async fn auto_remove_disabled_keeps_container() {
    let fx = Fixture::new();
    let runtime = Arc::new(FakeRuntime::exiting(3, &[]));
    let mut envs = HashMap::new();
    envs.insert("web".to_string(), env());
    let config = ContainerConfig {
        auto_remove: false,
        poll_interval_ms: 10,
        ..ContainerConfig::default()
    };
    let lifecycle = ContainerLifecycle::new(runtime.clone(), config, envs, fx.dir.path().join("staging"));

    let result = lifecycle
        .execute(&fx.request("go"), &CollectedLines::default(), &StopSignal::new())
        .await;

    assert_eq!(result.exit_code, 3);
    assert!(runtime.removed.lock().unwrap().is_empty());
}

//! Container engine seam.
//!
//! [`ContainerRuntime`] is what the lifecycle manager drives; [`DockerCli`]
//! implements it by shelling out to a docker-compatible binary.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use dh_core::config::Mount;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to exec {engine}: {source}")]
    Exec {
        engine: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{engine} {command} failed: {stderr}")]
    Command {
        engine: String,
        command: String,
        stderr: String,
    },

    #[error("unexpected engine output: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Everything needed to start one detached container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub workdir: String,
    pub command: Vec<String>,
}

/// Snapshot of a container's state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    /// Only meaningful once `running` is false.
    pub exit_code: Option<i32>,
    pub oom_killed: bool,
}

impl ContainerState {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            running: false,
            exit_code: Some(exit_code),
            oom_killed: false,
        }
    }
}

// ---------------------------------------------------------------------------
// ContainerRuntime trait
// ---------------------------------------------------------------------------

/// Abstraction over the container engine so the lifecycle can be tested
/// without one.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached container and return its id.
    async fn start(&self, spec: &ContainerSpec) -> Result<String>;

    /// Follow combined stdout/stderr. The channel closes once the container
    /// has exited and its output has been read.
    async fn logs(&self, container_id: &str) -> Result<flume::Receiver<String>>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerState>;

    async fn kill(&self, container_id: &str) -> Result<()>;

    async fn remove(&self, container_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// DockerCli
// ---------------------------------------------------------------------------

/// Runtime backed by the `docker` CLI (or any binary with the same verbs,
/// e.g. `podman`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    engine: String,
}

impl DockerCli {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Arguments for `<engine> run` that start `spec` detached.
    pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".into(), "-d".into()];
        if !spec.name.is_empty() {
            args.extend(["--name".into(), spec.name.clone()]);
        }
        for (key, value) in &spec.labels {
            args.extend(["--label".into(), format!("{key}={value}")]);
        }
        for mount in &spec.mounts {
            let mut volume = format!("{}:{}", mount.host.display(), mount.container);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.extend(["-v".into(), volume]);
        }
        for (key, value) in &spec.env {
            args.extend(["-e".into(), format!("{key}={value}")]);
        }
        if !spec.workdir.is_empty() {
            args.extend(["-w".into(), spec.workdir.clone()]);
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let output = Command::new(&self.engine)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RuntimeError::Exec {
                engine: self.engine.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(RuntimeError::Command {
                engine: self.engine.clone(),
                command: args.first().cloned().unwrap_or_default(),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

/// The subset of `.State` from `docker inspect` that matters here.
#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "ExitCode", default)]
    exit_code: i32,
    #[serde(rename = "OOMKilled", default)]
    oom_killed: bool,
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn start(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.run(&Self::run_args(spec)).await?;
        if id.is_empty() {
            return Err(RuntimeError::Parse("empty container id from run".into()));
        }
        debug!(container_id = %id, image = %spec.image, "container started");
        Ok(id)
    }

    async fn logs(&self, container_id: &str) -> Result<flume::Receiver<String>> {
        let mut child = Command::new(&self.engine)
            .args(["logs", "-f", container_id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Exec {
                engine: self.engine.clone(),
                source,
            })?;

        let (tx, rx) = flume::unbounded();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }
        let id = container_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = child.wait().await {
                warn!(container_id = %id, error = %e, "log follower did not exit cleanly");
            }
        });
        Ok(rx)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState> {
        let raw = self
            .run(&[
                "inspect".into(),
                "--format".into(),
                "{{json .State}}".into(),
                container_id.into(),
            ])
            .await?;
        let state: InspectState = serde_json::from_str(&raw)
            .map_err(|e| RuntimeError::Parse(format!("inspect state for {container_id}: {e}")))?;
        Ok(ContainerState {
            running: state.running,
            exit_code: (!state.running).then_some(state.exit_code),
            oom_killed: state.oom_killed,
        })
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        self.run(&["kill".into(), container_id.into()]).await.map(|_| ())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.run(&["rm".into(), "-f".into(), container_id.into()])
            .await
            .map(|_| ())
    }
}

async fn forward_lines<R>(reader: R, tx: flume::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                // Agents emit raw terminal bytes, not always valid UTF-8.
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send_async(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "log stream read failed");
                break;
            }
        }
    }
}

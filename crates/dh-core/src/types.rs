use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// CliType
// ---------------------------------------------------------------------------

/// The fixed set of coding-agent CLIs that can run inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliType {
    Claude,
    Codex,
    Gemini,
    OpenCode,
}

impl CliType {
    pub const ALL: [CliType; 4] = [
        CliType::Claude,
        CliType::Codex,
        CliType::Gemini,
        CliType::OpenCode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CliType::Claude => "claude",
            CliType::Codex => "codex",
            CliType::Gemini => "gemini",
            CliType::OpenCode => "open_code",
        }
    }
}

impl fmt::Display for CliType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CliType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(CliType::Claude),
            "codex" => Ok(CliType::Codex),
            "gemini" => Ok(CliType::Gemini),
            "opencode" | "open_code" | "open-code" => Ok(CliType::OpenCode),
            other => Err(format!("unknown agent cli: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Configured agent definition, as it appears under `[agents.<id>]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub cli: CliType,
    /// Host directory holding the CLI's credentials and settings.
    pub config_dir: PathBuf,
    #[serde(default)]
    pub extra_flags: Vec<String>,
    /// Id of the agent to fall back to once this one is exhausted.
    #[serde(default)]
    pub fallback: Option<String>,
}

/// One agent as used by a running task. Never changes for the task's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: String,
    pub cli: CliType,
    pub config_dir: PathBuf,
    pub extra_flags: Vec<String>,
}

impl AgentInstance {
    pub fn new(id: impl Into<String>, cli: CliType, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            cli,
            config_dir: config_dir.into(),
            extra_flags: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.extra_flags = flags;
        self
    }

    fn from_profile(id: &str, profile: &AgentProfile) -> Self {
        Self {
            id: id.to_string(),
            cli: profile.cli,
            config_dir: profile.config_dir.clone(),
            extra_flags: profile.extra_flags.clone(),
        }
    }
}

/// Ordered primary + fallback agents, flattened once when a task starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentChain {
    agents: Vec<AgentInstance>,
}

impl AgentChain {
    pub fn new(agents: Vec<AgentInstance>) -> Self {
        Self { agents }
    }

    /// Walk the fallback links starting at `primary`.
    ///
    /// Stops at the first id already visited or not present in `profiles`,
    /// so a cyclic or dangling fallback map still yields a finite chain.
    pub fn resolve(primary: &str, profiles: &HashMap<String, AgentProfile>) -> Self {
        let mut agents = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(primary.to_string());

        while let Some(id) = cursor.take() {
            if !seen.insert(id.clone()) {
                tracing::debug!(agent = %id, "fallback cycle detected, truncating chain");
                break;
            }
            let Some(profile) = profiles.get(&id) else {
                tracing::debug!(agent = %id, "fallback target missing, truncating chain");
                break;
            };
            agents.push(AgentInstance::from_profile(&id, profile));
            cursor = profile.fallback.clone();
        }

        Self { agents }
    }

    pub fn get(&self, index: usize) -> Option<&AgentInstance> {
        self.agents.get(index)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn primary(&self) -> Option<&AgentInstance> {
        self.agents.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentInstance> {
        self.agents.iter()
    }

    /// The chain with the first `index` agents dropped.
    pub fn starting_at(&self, index: usize) -> Self {
        Self {
            agents: self.agents.iter().skip(index).cloned().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

/// How the container for an attempt came to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    Normal,
    Killed,
    OutOfMemory,
    /// The container was never started: building the invocation or running
    /// the engine binary itself failed.
    LaunchFailed,
}

/// A file an agent left in its staging directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub path: PathBuf,
    /// Path relative to the staging directory; becomes the artifact's name.
    pub relative_path: PathBuf,
    pub size_bytes: u64,
}

/// Outcome of one container run for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResult {
    pub agent_id: String,
    pub cli: CliType,
    pub exit_code: i32,
    pub log_tail: Vec<String>,
    pub terminal_reason: TerminalReason,
    pub staged_files: Vec<StagedFile>,
    pub staging_dir: Option<PathBuf>,
    pub container_id: Option<String>,
    pub error: Option<String>,
}

impl AttemptResult {
    /// Result for an attempt whose container could not be launched at all.
    pub fn launch_failure(agent: &AgentInstance, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent.id.clone(),
            cli: agent.cli,
            exit_code: 1,
            log_tail: Vec::new(),
            terminal_reason: TerminalReason::LaunchFailed,
            staged_files: Vec::new(),
            staging_dir: None,
            container_id: None,
            error: Some(error.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.terminal_reason != TerminalReason::LaunchFailed
    }

    /// Last non-empty log line, or the error text when there is no output.
    pub fn summary_line(&self) -> Option<&str> {
        self.error.as_deref().or_else(|| {
            self.log_tail
                .iter()
                .rev()
                .map(|l| l.trim())
                .find(|l| !l.is_empty())
        })
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskOutcome::Succeeded => "succeeded",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Supervisor state of a task. Only `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "outcome")]
pub enum TaskStatus {
    Initialize,
    Launch,
    Running,
    DetectExit,
    Success,
    ClassifyError,
    Retry,
    SwitchAgent,
    TerminalFail,
    Completed(TaskOutcome),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed(_))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Initialize => f.write_str("initialize"),
            TaskStatus::Launch => f.write_str("launch"),
            TaskStatus::Running => f.write_str("running"),
            TaskStatus::DetectExit => f.write_str("detect_exit"),
            TaskStatus::Success => f.write_str("success"),
            TaskStatus::ClassifyError => f.write_str("classify_error"),
            TaskStatus::Retry => f.write_str("retry"),
            TaskStatus::SwitchAgent => f.write_str("switch_agent"),
            TaskStatus::TerminalFail => f.write_str("terminal_fail"),
            TaskStatus::Completed(outcome) => write!(f, "completed({outcome})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub prompt: String,
    pub environment_id: String,
    pub environment_name: String,
    /// Host working directory prepared by the workspace collaborator.
    pub workdir: PathBuf,
    pub branch: Option<String>,
    pub chain: AgentChain,
    pub status: TaskStatus,
    /// Retry counters keyed by agent id.
    pub retry_counts: HashMap<String, u32>,
    pub artifacts: Vec<Uuid>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        prompt: impl Into<String>,
        environment_id: impl Into<String>,
        environment_name: impl Into<String>,
        workdir: impl Into<PathBuf>,
        chain: AgentChain,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            environment_id: environment_id.into(),
            environment_name: environment_name.into(),
            workdir: workdir.into(),
            branch: None,
            chain,
            status: TaskStatus::Initialize,
            retry_counts: HashMap::new(),
            artifacts: Vec::new(),
            exit_code: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn retries_for(&self, agent_id: &str) -> u32 {
        self.retry_counts.get(agent_id).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Plaintext description of an encrypted artifact, stored next to its blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub id: Uuid,
    pub task_id: Uuid,
    pub environment_name: String,
    pub original_name: String,
    pub size_bytes: u64,
    /// SHA-256 of the plaintext, hex encoded.
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub task_id: Uuid,
    pub blob_path: PathBuf,
    pub meta: ArtifactMeta,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{AgentChain, AgentProfile, CliType};

/// Top-level configuration loaded from `~/.dockhand/config.toml`.
///
/// Agent credentials never live here: each agent profile points at a host
/// config directory that is mounted into the container as-is.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub agents: HashMap<String, AgentProfile>,
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentConfig>,
}

impl Config {
    /// Load config from `~/.dockhand/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "scheduler.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.container.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "container.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        self.rate_limits.validate()?;
        for (id, env) in &self.environments {
            if !self.agents.contains_key(&env.primary_agent) {
                return Err(ConfigError::Validation(format!(
                    "environments.{id}.primary_agent '{}' is not a defined agent",
                    env.primary_agent
                )));
            }
        }
        Ok(())
    }

    pub fn environment(&self, id: &str) -> Option<&EnvironmentConfig> {
        self.environments.get(id)
    }

    /// Resolve the agent chain for an environment. Unknown environments
    /// yield an empty chain.
    pub fn chain_for(&self, environment_id: &str) -> AgentChain {
        match self.environments.get(environment_id) {
            Some(env) => AgentChain::resolve(&env.primary_agent, &self.agents),
            None => AgentChain::default(),
        }
    }

    /// Directory holding the cooldown ledger and artifacts.
    pub fn data_dir(&self) -> PathBuf {
        match &self.general.data_dir {
            Some(dir) => expand_home(dir),
            None => default_data_dir(),
        }
    }

    pub fn cooldown_dir(&self) -> PathBuf {
        self.data_dir().join("cooldowns")
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.data_dir().join("artifacts")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir().join("staging")
    }

    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dockhand")
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Defaults to `~/.dockhand`.
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            data_dir: None,
        }
    }
}

fn default_project_name() -> String {
    "dockhand".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Retry and fallback limits for one task run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries_per_agent: u32,
    /// Delay before the n-th ordinary retry; the last entry repeats.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
    /// Delay before the n-th retry after a rate limit; the last entry repeats.
    #[serde(default = "default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: Vec<u64>,
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_retries_per_agent: default_max_retries(),
            backoff_secs: default_backoff_secs(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
            fallback_enabled: true,
        }
    }
}

impl SupervisorConfig {
    /// Delay before retry number `attempt_index` (zero based).
    pub fn backoff(&self, attempt_index: u32, rate_limited: bool) -> Duration {
        let schedule = if rate_limited {
            &self.rate_limit_backoff_secs
        } else {
            &self.backoff_secs
        };
        let secs = schedule
            .get(attempt_index as usize)
            .or_else(|| schedule.last())
            .copied()
            .unwrap_or(0);
        Duration::from_secs(secs)
    }

    /// A config with no delays, handy for tests and dry runs.
    pub fn immediate(max_retries_per_agent: u32) -> Self {
        Self {
            max_retries_per_agent,
            backoff_secs: vec![0],
            rate_limit_backoff_secs: vec![0],
            fallback_enabled: true,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_secs() -> Vec<u64> {
    vec![5, 15, 30]
}
fn default_rate_limit_backoff_secs() -> Vec<u64> {
    vec![60, 120, 300]
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container engine binary (`docker`, `podman`, ...).
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Image per agent CLI, keyed by CLI name.
    #[serde(default = "default_images")]
    pub images: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub auto_remove: bool,
    /// How often the terminal state of a running container is polled.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            images: default_images(),
            auto_remove: true,
            poll_interval_ms: default_poll_interval_ms(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

impl ContainerConfig {
    pub fn image_for(&self, cli: CliType) -> Option<&str> {
        self.images.get(cli.as_str()).map(String::as_str)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_engine() -> String {
    "docker".into()
}
fn default_images() -> BTreeMap<String, String> {
    CliType::ALL
        .iter()
        .map(|cli| (cli.as_str().to_string(), format!("dockhand/{}:latest", cli.as_str())))
        .collect()
}

fn default_poll_interval_ms() -> u64 {
    500
}
fn default_log_tail_lines() -> usize {
    200
}

/// Rate-limit and authentication detection data.
///
/// The defaults are deliberately conservative and not exhaustive; CLIs change
/// their wording, so these are meant to be tuned per installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Cooldown recorded when no retry-after hint is found in the logs.
    #[serde(default = "default_cooldown_secs")]
    pub default_cooldown_secs: u64,
    /// Regexes per CLI name that indicate a provider rate limit.
    #[serde(default = "default_rate_limit_patterns")]
    pub patterns: BTreeMap<String, Vec<String>>,
    /// Regex with one capture group for the number and an optional second
    /// group for the unit (s, m, h).
    #[serde(default = "default_retry_after_pattern")]
    pub retry_after_pattern: String,
    /// Regexes indicating an authentication or permission failure.
    #[serde(default = "default_auth_patterns")]
    pub auth_patterns: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_cooldown_secs: default_cooldown_secs(),
            patterns: default_rate_limit_patterns(),
            retry_after_pattern: default_retry_after_pattern(),
            auth_patterns: default_auth_patterns(),
        }
    }
}

impl RateLimitConfig {
    pub fn default_cooldown(&self) -> Duration {
        Duration::from_secs(self.default_cooldown_secs)
    }

    pub fn patterns_for(&self, cli: CliType) -> &[String] {
        self.patterns
            .get(cli.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let check = |field: &str, pattern: &str| {
            regex::Regex::new(pattern).map(|_| ()).map_err(|e| {
                ConfigError::Validation(format!("rate_limits.{field}: invalid pattern '{pattern}': {e}"))
            })
        };
        for (cli, patterns) in &self.patterns {
            if cli.parse::<CliType>().is_err() {
                return Err(ConfigError::Validation(format!(
                    "rate_limits.patterns: unknown agent cli '{cli}'"
                )));
            }
            for p in patterns {
                check("patterns", p)?;
            }
        }
        check("retry_after_pattern", &self.retry_after_pattern)?;
        for p in &self.auth_patterns {
            check("auth_patterns", p)?;
        }
        Ok(())
    }
}

fn default_cooldown_secs() -> u64 {
    300
}
fn default_rate_limit_patterns() -> BTreeMap<String, Vec<String>> {
    let mut map = BTreeMap::new();
    map.insert(
        CliType::Claude.as_str().to_string(),
        vec![
            r"(?i)rate[ _-]?limit".to_string(),
            r"(?i)usage limit reached".to_string(),
        ],
    );
    map.insert(
        CliType::Codex.as_str().to_string(),
        vec![
            r"(?i)rate[ _-]?limit".to_string(),
            r"(?i)too many requests".to_string(),
        ],
    );
    map.insert(
        CliType::Gemini.as_str().to_string(),
        vec![
            r"RESOURCE_EXHAUSTED".to_string(),
            r"(?i)quota exceeded".to_string(),
        ],
    );
    map.insert(
        CliType::OpenCode.as_str().to_string(),
        vec![r"(?i)rate[ _-]?limit".to_string()],
    );
    map
}
fn default_retry_after_pattern() -> String {
    r"(?i)retry[ _-]?after\D{0,3}(\d+)\s*(s|sec|secs|seconds|m|min|mins|minutes|h|hours?)?\b"
        .to_string()
}
fn default_auth_patterns() -> Vec<String> {
    vec![
        r"(?i)invalid api[ _-]?key".to_string(),
        r"(?i)authentication (failed|error|required)".to_string(),
        r"(?i)\bunauthori[sz]ed\b".to_string(),
        r"(?i)permission denied".to_string(),
        r"(?i)not logged in".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_max_concurrent() -> u32 {
    4
}

/// A user-declared bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    #[serde(default)]
    pub read_only: bool,
}

/// One runnable environment: which agents to use and how to set up the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub primary_agent: String,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Shell script run before the agent; its failure does not abort the attempt.
    #[serde(default)]
    pub preflight_script: Option<String>,
}

impl EnvironmentConfig {
    pub fn new(name: impl Into<String>, primary_agent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_agent: primary_agent.into(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            preflight_script: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

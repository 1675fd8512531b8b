//! Per-agent rate-limit cooldown ledger.
//!
//! One [`AgentWatchState`] per agent CLI, shared by every task that uses that
//! CLI. Cooldowns expire by comparison with the clock; nothing runs in the
//! background to clear them. Each mutation is written through to a JSON file
//! per CLI so cooldowns survive a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::types::CliType;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    #[default]
    Ready,
    OnCooldown,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentWatchState {
    pub cli: CliType,
    pub last_rate_limited_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub status: WatchStatus,
}

impl AgentWatchState {
    pub fn ready(cli: CliType) -> Self {
        Self {
            cli,
            last_rate_limited_at: None,
            cooldown_until: None,
            reason: None,
            status: WatchStatus::Ready,
        }
    }

    /// Status as of `now`. An elapsed cooldown reads as ready even though the
    /// stored tag still says otherwise.
    pub fn status_at(&self, now: DateTime<Utc>) -> WatchStatus {
        match self.status {
            WatchStatus::OnCooldown if !self.cooling_at(now) => WatchStatus::Ready,
            other => other,
        }
    }

    fn cooling_at(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    fn remaining_at(&self, now: DateTime<Utc>) -> f64 {
        match self.cooldown_until {
            Some(until) if until > now => (until - now).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CooldownError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// CooldownStore
// ---------------------------------------------------------------------------

/// One JSON file per agent CLI under a base directory.
#[derive(Debug, Clone)]
pub struct CooldownStore {
    base_dir: PathBuf,
}

impl CooldownStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, cli: CliType) -> PathBuf {
        self.base_dir.join(format!("{}.json", cli.as_str()))
    }

    /// Atomically replace the record for one CLI.
    pub fn save(&self, state: &AgentWatchState) -> Result<(), CooldownError> {
        std::fs::create_dir_all(&self.base_dir)?;
        let path = self.path_for(state.cli);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read every stored record. Unreadable or corrupt files are skipped.
    pub fn load_all(&self) -> Result<Vec<AgentWatchState>, CooldownError> {
        let mut states = Vec::new();
        for cli in CliType::ALL {
            let path = self.path_for(cli);
            if !path.exists() {
                continue;
            }
            let parsed = std::fs::read(&path)
                .map_err(CooldownError::from)
                .and_then(|data| Ok(serde_json::from_slice::<AgentWatchState>(&data)?));
            match parsed {
                Ok(state) if state.cli == cli => states.push(state),
                Ok(state) => {
                    warn!(path = %path.display(), found = %state.cli, "cooldown record names a different cli, skipping")
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable cooldown record"),
            }
        }
        Ok(states)
    }
}

// ---------------------------------------------------------------------------
// CooldownTracker
// ---------------------------------------------------------------------------

/// Lock-guarded ledger shared by the pre-launch check and every supervisor.
///
/// A single lock covers all agents; it is only held for the read, modify and
/// persist of cooldown fields, never across a container run.
#[derive(Debug)]
pub struct CooldownTracker {
    states: Mutex<HashMap<CliType, AgentWatchState>>,
    store: Option<CooldownStore>,
}

impl CooldownTracker {
    /// Load persisted state once at startup.
    pub fn load(store: CooldownStore) -> Result<Self, CooldownError> {
        let states: HashMap<_, _> = store
            .load_all()?
            .into_iter()
            .map(|s| (s.cli, s))
            .collect();
        info!(dir = %store.base_dir().display(), records = states.len(), "cooldown ledger loaded");
        Ok(Self {
            states: Mutex::new(states),
            store: Some(store),
        })
    }

    /// A tracker that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CliType, AgentWatchState>> {
        self.states.lock().unwrap_or_else(|e| {
            warn!("cooldown lock was poisoned, recovering");
            e.into_inner()
        })
    }

    fn persist(&self, state: &AgentWatchState) -> Result<(), CooldownError> {
        match &self.store {
            Some(store) => store.save(state),
            None => Ok(()),
        }
    }

    /// Put `cli` on cooldown for `duration` from now.
    ///
    /// An existing later expiry is kept: a shorter hint never shortens a
    /// cooldown that is already in force.
    pub fn record_rate_limit(
        &self,
        cli: CliType,
        duration: Duration,
        reason: impl Into<String>,
    ) -> Result<DateTime<Utc>, CooldownError> {
        let now = Utc::now();
        let span = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        let proposed = now.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut states = self.lock();
        let entry = states.entry(cli).or_insert_with(|| AgentWatchState::ready(cli));
        let until = match entry.cooldown_until {
            Some(existing) if existing > proposed => existing,
            _ => proposed,
        };
        entry.last_rate_limited_at = Some(now);
        entry.cooldown_until = Some(until);
        entry.reason = Some(reason.into());
        entry.status = WatchStatus::OnCooldown;
        let snapshot = entry.clone();
        self.persist(&snapshot)?;
        drop(states);

        info!(agent = %cli, until = %until, "agent placed on cooldown");
        Ok(until)
    }

    /// Flag `cli` as unusable (e.g. the binary is missing from its image).
    /// Informational only; it does not block launches.
    pub fn mark_unavailable(&self, cli: CliType, reason: impl Into<String>) -> Result<(), CooldownError> {
        let mut states = self.lock();
        let entry = states.entry(cli).or_insert_with(|| AgentWatchState::ready(cli));
        if entry.cooling_at(Utc::now()) {
            debug!(agent = %cli, "agent on cooldown, keeping cooldown status");
            return Ok(());
        }
        entry.status = WatchStatus::Unavailable;
        entry.reason = Some(reason.into());
        let snapshot = entry.clone();
        self.persist(&snapshot)
    }

    /// Undo [`mark_unavailable`](Self::mark_unavailable) after the CLI has
    /// worked again. Cooldowns are untouched.
    pub fn mark_available(&self, cli: CliType) -> Result<(), CooldownError> {
        let mut states = self.lock();
        let Some(entry) = states.get_mut(&cli) else {
            return Ok(());
        };
        if entry.status != WatchStatus::Unavailable {
            return Ok(());
        }
        entry.status = WatchStatus::Ready;
        entry.reason = None;
        let snapshot = entry.clone();
        self.persist(&snapshot)
    }

    pub fn is_on_cooldown(&self, cli: CliType) -> bool {
        let now = Utc::now();
        self.lock().get(&cli).is_some_and(|s| s.cooling_at(now))
    }

    pub fn seconds_remaining(&self, cli: CliType) -> f64 {
        let now = Utc::now();
        self.lock().get(&cli).map_or(0.0, |s| s.remaining_at(now))
    }

    /// Explicit bypass. Clearing an agent that is not cooling down is a no-op.
    pub fn clear(&self, cli: CliType) -> Result<(), CooldownError> {
        let mut states = self.lock();
        let Some(entry) = states.get_mut(&cli) else {
            return Ok(());
        };
        if entry.status == WatchStatus::Ready && entry.cooldown_until.is_none() {
            return Ok(());
        }
        entry.cooldown_until = None;
        entry.reason = None;
        entry.status = WatchStatus::Ready;
        let snapshot = entry.clone();
        self.persist(&snapshot)?;
        drop(states);

        info!(agent = %cli, "cooldown cleared");
        Ok(())
    }

    pub fn state(&self, cli: CliType) -> AgentWatchState {
        self.lock()
            .get(&cli)
            .cloned()
            .unwrap_or_else(|| AgentWatchState::ready(cli))
    }

    /// Current state of every CLI, in `CliType::ALL` order.
    pub fn snapshot(&self) -> Vec<AgentWatchState> {
        let states = self.lock();
        CliType::ALL
            .iter()
            .map(|cli| {
                states
                    .get(cli)
                    .cloned()
                    .unwrap_or_else(|| AgentWatchState::ready(*cli))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_agent_is_ready() {
        let tracker = CooldownTracker::in_memory();
        assert!(!tracker.is_on_cooldown(CliType::Claude));
        assert_eq!(tracker.seconds_remaining(CliType::Claude), 0.0);
        assert_eq!(tracker.state(CliType::Claude).status, WatchStatus::Ready);
    }

    #[test]
    fn later_write_never_shortens_cooldown() {
        let tracker = CooldownTracker::in_memory();
        let long = tracker
            .record_rate_limit(CliType::Codex, Duration::from_secs(600), "quota")
            .unwrap();
        let second = tracker
            .record_rate_limit(CliType::Codex, Duration::from_secs(5), "again")
            .unwrap();
        assert_eq!(long, second);
        assert!(tracker.seconds_remaining(CliType::Codex) > 500.0);
        assert_eq!(
            tracker.state(CliType::Codex).reason.as_deref(),
            Some("again")
        );
    }

    #[test]
    fn longer_write_extends_cooldown() {
        let tracker = CooldownTracker::in_memory();
        tracker
            .record_rate_limit(CliType::Codex, Duration::from_secs(5), "short")
            .unwrap();
        tracker
            .record_rate_limit(CliType::Codex, Duration::from_secs(600), "long")
            .unwrap();
        assert!(tracker.seconds_remaining(CliType::Codex) > 500.0);
    }

    #[test]
    fn expired_cooldown_reads_ready() {
        let mut state = AgentWatchState::ready(CliType::Gemini);
        let now = Utc::now();
        state.status = WatchStatus::OnCooldown;
        state.cooldown_until = Some(now - chrono::Duration::seconds(1));
        assert_eq!(state.status_at(now), WatchStatus::Ready);
    }

    #[test]
    fn unavailable_does_not_override_active_cooldown() {
        let tracker = CooldownTracker::in_memory();
        tracker
            .record_rate_limit(CliType::Claude, Duration::from_secs(60), "429")
            .unwrap();
        tracker.mark_unavailable(CliType::Claude, "missing").unwrap();
        assert_eq!(tracker.state(CliType::Claude).status, WatchStatus::OnCooldown);
    }

    #[test]
    fn mark_available_reverts_unavailable_only() {
        let tracker = CooldownTracker::in_memory();
        tracker.mark_unavailable(CliType::Codex, "exit 127").unwrap();
        assert_eq!(tracker.state(CliType::Codex).status, WatchStatus::Unavailable);
        assert!(!tracker.is_on_cooldown(CliType::Codex));

        tracker.mark_available(CliType::Codex).unwrap();
        assert_eq!(tracker.state(CliType::Codex).status, WatchStatus::Ready);

        tracker
            .record_rate_limit(CliType::Codex, Duration::from_secs(60), "429")
            .unwrap();
        tracker.mark_available(CliType::Codex).unwrap();
        assert!(tracker.is_on_cooldown(CliType::Codex));
    }

    #[test]
    fn snapshot_lists_every_cli() {
        let tracker = CooldownTracker::in_memory();
        assert_eq!(tracker.snapshot().len(), CliType::ALL.len());
    }
}

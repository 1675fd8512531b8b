//! Cooldown check made before a task is created.
//!
//! If the primary agent is cooling down the caller picks one of three ways
//! forward. None of them changes the environment's configured chain.

use dh_core::cooldown::{CooldownError, CooldownTracker};
use dh_core::types::{AgentChain, CliType};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PreLaunch {
    Ready,
    OnCooldown {
        agent_id: String,
        cli: CliType,
        seconds_remaining: f64,
        reason: Option<String>,
        /// Whether the chain has another agent to start with instead.
        fallback_available: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownChoice {
    /// Start this one task on the next agent in the chain.
    UseFallback,
    /// Clear the cooldown and start on the primary.
    Bypass,
    /// Do not create the task.
    Cancel,
}

/// Inspect the chain's primary agent.
pub fn check(tracker: &CooldownTracker, chain: &AgentChain) -> PreLaunch {
    let Some(primary) = chain.primary() else {
        return PreLaunch::Ready;
    };
    if !tracker.is_on_cooldown(primary.cli) {
        return PreLaunch::Ready;
    }
    let state = tracker.state(primary.cli);
    PreLaunch::OnCooldown {
        agent_id: primary.id.clone(),
        cli: primary.cli,
        seconds_remaining: tracker.seconds_remaining(primary.cli),
        reason: state.reason,
        fallback_available: chain.len() > 1,
    }
}

/// Apply the caller's choice. `Ok(None)` means no task should be started.
pub fn resolve_choice(
    tracker: &CooldownTracker,
    chain: &AgentChain,
    choice: CooldownChoice,
) -> Result<Option<AgentChain>, CooldownError> {
    match choice {
        CooldownChoice::UseFallback => {
            if chain.len() < 2 {
                info!("no fallback agent configured, not starting task");
                return Ok(None);
            }
            Ok(Some(chain.starting_at(1)))
        }
        CooldownChoice::Bypass => {
            if let Some(primary) = chain.primary() {
                tracker.clear(primary.cli)?;
                info!(agent = %primary.cli, "cooldown bypassed by user");
            }
            Ok(Some(chain.clone()))
        }
        CooldownChoice::Cancel => Ok(None),
    }
}

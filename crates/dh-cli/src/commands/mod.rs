pub mod artifacts;
pub mod config;
pub mod cooldown;
pub mod run;

use anyhow::Context;
use dh_core::artifacts::ArtifactStore;
use dh_core::config::Config;
use dh_core::cooldown::{CooldownStore, CooldownTracker};

/// Load the persisted cooldown ledger from the configured data dir.
pub fn open_cooldowns(cfg: &Config) -> anyhow::Result<CooldownTracker> {
    let dir = cfg.cooldown_dir();
    CooldownTracker::load(CooldownStore::new(&dir))
        .with_context(|| format!("reading cooldowns from {}", dir.display()))
}

pub fn open_artifacts(cfg: &Config) -> ArtifactStore {
    ArtifactStore::new(cfg.artifact_dir())
}

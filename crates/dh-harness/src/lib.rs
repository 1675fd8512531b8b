//! Harness: failure classification and retry plumbing for the dockhand
//! supervisor.
//!
//! - Error classification of finished attempts (exit code, terminal reason, log tail)
//! - Backoff schedules for ordinary and rate-limited retries
//! - Cooperative stop signal shared between a task handle and its supervisor

pub mod backoff;
pub mod classifier;
pub mod stop;

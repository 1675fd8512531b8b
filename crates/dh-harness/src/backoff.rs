use std::time::Duration;

use dh_core::config::SupervisorConfig;

use crate::classifier::FailureCategory;

/// Delay before relaunching a crashed container for the first time.
pub const FRESH_CONTAINER_DELAY: Duration = Duration::ZERO;

/// Delay before retry number `retry_index` (zero based) after `category`.
///
/// Rate limits use the longer schedule; every other category uses the
/// ordinary one. Both clamp to their last entry.
pub fn backoff_for(config: &SupervisorConfig, retry_index: u32, category: &FailureCategory) -> Duration {
    config.backoff(retry_index, category.is_rate_limit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_uses_long_schedule() {
        let cfg = SupervisorConfig::default();
        let rl = FailureCategory::RateLimit { retry_after: None };
        assert_eq!(backoff_for(&cfg, 0, &rl), Duration::from_secs(60));
        assert_eq!(backoff_for(&cfg, 2, &rl), Duration::from_secs(300));
        assert_eq!(backoff_for(&cfg, 9, &rl), Duration::from_secs(300));
    }

    #[test]
    fn other_categories_use_short_schedule() {
        let cfg = SupervisorConfig::default();
        for cat in [
            FailureCategory::Retryable,
            FailureCategory::AgentFailure,
            FailureCategory::ContainerCrash,
        ] {
            assert_eq!(backoff_for(&cfg, 0, &cat), Duration::from_secs(5));
            assert_eq!(backoff_for(&cfg, 1, &cat), Duration::from_secs(15));
        }
    }
}

//! Maps a finished attempt onto a failure category.
//!
//! Classification is a pure function of the agent CLI, the exit code, the
//! container's terminal reason and the tail of its output. Patterns come from
//! [`RateLimitConfig`] so they can be tuned without a rebuild.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use dh_core::config::RateLimitConfig;
use dh_core::types::{CliType, TerminalReason};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

/// Only this many trailing log lines are inspected.
pub const SCAN_LINES: usize = 100;

const EXIT_RATE_LIMITED: i32 = 429;
const EXIT_SIGKILL: i32 = 137;
const EXIT_NOT_EXECUTABLE: i32 = 126;
const EXIT_NOT_FOUND: i32 = 127;

// ---------------------------------------------------------------------------
// FailureCategory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "category")]
pub enum FailureCategory {
    /// Transient, non-specific failure.
    Retryable,
    /// Provider quota hit. `retry_after` is the hint found in the logs, if any.
    RateLimit { retry_after: Option<Duration> },
    /// The agent CLI is broken or missing from the image.
    AgentFailure,
    /// Infrastructure-level failure: OOM kill or SIGKILL.
    ContainerCrash,
    /// Never retried, never falls back.
    Fatal,
}

impl FailureCategory {
    pub fn label(&self) -> &'static str {
        match self {
            FailureCategory::Retryable => "retryable",
            FailureCategory::RateLimit { .. } => "rate_limit",
            FailureCategory::AgentFailure => "agent_failure",
            FailureCategory::ContainerCrash => "container_crash",
            FailureCategory::Fatal => "fatal",
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, FailureCategory::RateLimit { .. })
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCategory::RateLimit {
                retry_after: Some(after),
            } => write!(f, "rate_limit (retry after {}s)", after.as_secs()),
            other => f.write_str(other.label()),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("invalid {field} pattern '{pattern}': {source}")]
    InvalidPattern {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

fn compile(field: &'static str, pattern: &str) -> Result<Regex, ClassifierError> {
    Regex::new(pattern).map_err(|source| ClassifierError::InvalidPattern {
        field,
        pattern: pattern.to_string(),
        source,
    })
}

// ---------------------------------------------------------------------------
// ErrorClassifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rate_limit: HashMap<CliType, Vec<Regex>>,
    retry_after: Regex,
    auth: Vec<Regex>,
}

impl ErrorClassifier {
    pub fn from_config(config: &RateLimitConfig) -> Result<Self, ClassifierError> {
        let mut rate_limit = HashMap::new();
        for cli in CliType::ALL {
            let compiled = config
                .patterns_for(cli)
                .iter()
                .map(|p| compile("rate limit", p))
                .collect::<Result<Vec<_>, _>>()?;
            rate_limit.insert(cli, compiled);
        }
        let auth = config
            .auth_patterns
            .iter()
            .map(|p| compile("auth", p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rate_limit,
            retry_after: compile("retry-after", &config.retry_after_pattern)?,
            auth,
        })
    }

    /// Classify a failed attempt.
    ///
    /// Checked in order: launch failure, OOM kill, rate limit (exit 429 or a
    /// per-CLI pattern), SIGKILL, missing or non-executable CLI (126/127),
    /// authentication pattern. Anything else is retryable.
    pub fn classify(
        &self,
        cli: CliType,
        exit_code: i32,
        reason: TerminalReason,
        log_tail: &[String],
    ) -> FailureCategory {
        let tail = &log_tail[log_tail.len().saturating_sub(SCAN_LINES)..];

        let category = if reason == TerminalReason::LaunchFailed {
            FailureCategory::Fatal
        } else if reason == TerminalReason::OutOfMemory {
            FailureCategory::ContainerCrash
        } else if exit_code == EXIT_RATE_LIMITED || self.matches_rate_limit(cli, tail) {
            FailureCategory::RateLimit {
                retry_after: self.extract_retry_after(tail),
            }
        } else if exit_code == EXIT_SIGKILL {
            FailureCategory::ContainerCrash
        } else if exit_code == EXIT_NOT_EXECUTABLE || exit_code == EXIT_NOT_FOUND {
            FailureCategory::AgentFailure
        } else if any_match(&self.auth, tail) {
            FailureCategory::Fatal
        } else {
            FailureCategory::Retryable
        };

        debug!(agent = %cli, exit_code, ?reason, category = category.label(), "attempt classified");
        category
    }

    fn matches_rate_limit(&self, cli: CliType, tail: &[String]) -> bool {
        self.rate_limit
            .get(&cli)
            .is_some_and(|patterns| any_match(patterns, tail))
    }

    /// Most recent "retry after N [unit]" hint in `lines`. A bare number is
    /// read as seconds.
    pub fn extract_retry_after(&self, lines: &[String]) -> Option<Duration> {
        lines.iter().rev().find_map(|line| {
            let caps = self.retry_after.captures(line)?;
            let amount: u64 = caps.get(1)?.as_str().parse().ok()?;
            let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
                Some(unit) if unit.starts_with('h') => 3600,
                Some(unit) if unit.starts_with('m') => 60,
                _ => 1,
            };
            Some(Duration::from_secs(amount.saturating_mul(multiplier)))
        })
    }
}

fn any_match(patterns: &[Regex], lines: &[String]) -> bool {
    lines
        .iter()
        .any(|line| patterns.iter().any(|p| p.is_match(line)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::from_config(&RateLimitConfig::default()).unwrap()
    }

    fn lines(text: &[&str]) -> Vec<String> {
        text.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn oom_beats_rate_limit() {
        let c = classifier();
        let tail = lines(&["rate limit exceeded"]);
        assert_eq!(
            c.classify(CliType::Claude, 429, TerminalReason::OutOfMemory, &tail),
            FailureCategory::ContainerCrash
        );
    }

    #[test]
    fn launch_failure_is_fatal() {
        let c = classifier();
        assert_eq!(
            c.classify(CliType::Codex, 1, TerminalReason::LaunchFailed, &[]),
            FailureCategory::Fatal
        );
    }

    #[test]
    fn retry_after_units() {
        let c = classifier();
        assert_eq!(
            c.extract_retry_after(&lines(&["Retry-After: 2m"])),
            Some(Duration::from_secs(120))
        );
        assert_eq!(
            c.extract_retry_after(&lines(&["please retry after 1 hour"])),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            c.extract_retry_after(&lines(&["retry_after=45"])),
            Some(Duration::from_secs(45))
        );
        assert_eq!(c.extract_retry_after(&lines(&["no hint"])), None);
    }

    #[test]
    fn latest_hint_wins() {
        let c = classifier();
        let tail = lines(&["retry after 10", "...", "retry after 90"]);
        assert_eq!(c.extract_retry_after(&tail), Some(Duration::from_secs(90)));
    }

    #[test]
    fn patterns_are_per_cli() {
        let c = classifier();
        let tail = lines(&["RESOURCE_EXHAUSTED"]);
        assert!(c
            .classify(CliType::Gemini, 1, TerminalReason::Normal, &tail)
            .is_rate_limit());
        assert_eq!(
            c.classify(CliType::Claude, 1, TerminalReason::Normal, &tail),
            FailureCategory::Retryable
        );
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let config = RateLimitConfig {
            retry_after_pattern: "(".into(),
            ..RateLimitConfig::default()
        };
        assert!(matches!(
            ErrorClassifier::from_config(&config),
            Err(ClassifierError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn display_includes_hint() {
        let cat = FailureCategory::RateLimit {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(cat.to_string(), "rate_limit (retry after 30s)");
        assert_eq!(FailureCategory::Fatal.to_string(), "fatal");
    }
}

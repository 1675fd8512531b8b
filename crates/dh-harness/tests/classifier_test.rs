use std::time::Duration;

use dh_core::config::RateLimitConfig;
use dh_core::types::{CliType, TerminalReason};
use dh_harness::classifier::{ErrorClassifier, FailureCategory, SCAN_LINES};

fn classifier() -> ErrorClassifier {
    ErrorClassifier::from_config(&RateLimitConfig::default()).unwrap()
}

fn lines(text: &[&str]) -> Vec<String> {
    text.iter().map(|s| s.to_string()).collect()
}

#[test]
fn plain_nonzero_exits_are_retryable() {
    let c = classifier();
    let tail = lines(&["compiling...", "error: test failed"]);
    for code in (1..=255).chain([-1, 300, 1000]) {
        if [126, 127, 137, 429].contains(&code) {
            continue;
        }
        for cli in CliType::ALL {
            assert_eq!(
                c.classify(cli, code, TerminalReason::Normal, &tail),
                FailureCategory::Retryable,
                "exit {code} for {cli}"
            );
        }
    }
}

#[test]
fn http_429_with_hint_is_rate_limit_with_duration() {
    let c = classifier();
    let tail = lines(&["rate limit exceeded, retry after 30"]);
    assert_eq!(
        c.classify(CliType::Claude, 429, TerminalReason::Normal, &tail),
        FailureCategory::RateLimit {
            retry_after: Some(Duration::from_secs(30))
        }
    );
}

#[test]
fn exit_429_without_hint_has_no_duration() {
    let c = classifier();
    assert_eq!(
        c.classify(CliType::Codex, 429, TerminalReason::Normal, &[]),
        FailureCategory::RateLimit { retry_after: None }
    );
}

#[test]
fn openai_error_code_and_plural_are_rate_limits() {
    let c = classifier();
    for text in [
        "Error: rate_limit_exceeded",
        "You have hit your rate limits",
        "Rate limit reached for gpt-4o",
    ] {
        assert!(
            c.classify(CliType::Codex, 1, TerminalReason::Normal, &lines(&[text]))
                .is_rate_limit(),
            "{text}"
        );
    }
    assert!(c
        .classify(CliType::Claude, 1, TerminalReason::Normal, &lines(&["API rate_limit_error"]))
        .is_rate_limit());
}

#[test]
fn rate_limit_pattern_beats_sigkill() {
    let c = classifier();
    let tail = lines(&["Error: Too Many Requests"]);
    assert!(c
        .classify(CliType::Codex, 137, TerminalReason::Killed, &tail)
        .is_rate_limit());
}

#[test]
fn sigkill_is_container_crash() {
    let c = classifier();
    assert_eq!(
        c.classify(CliType::Gemini, 137, TerminalReason::Killed, &[]),
        FailureCategory::ContainerCrash
    );
}

#[test]
fn missing_cli_is_agent_failure() {
    let c = classifier();
    let tail = lines(&["sh: codex: not found"]);
    assert_eq!(
        c.classify(CliType::Codex, 127, TerminalReason::Normal, &tail),
        FailureCategory::AgentFailure
    );
    assert_eq!(
        c.classify(CliType::Codex, 126, TerminalReason::Normal, &[]),
        FailureCategory::AgentFailure
    );
}

#[test]
fn auth_failure_is_fatal() {
    let c = classifier();
    let tail = lines(&["Error: Invalid API key provided"]);
    assert_eq!(
        c.classify(CliType::Claude, 1, TerminalReason::Normal, &tail),
        FailureCategory::Fatal
    );
}

#[test]
fn missing_cli_beats_auth_pattern() {
    let c = classifier();
    let tail = lines(&["permission denied"]);
    assert_eq!(
        c.classify(CliType::Claude, 127, TerminalReason::Normal, &tail),
        FailureCategory::AgentFailure
    );
}

#[test]
fn only_recent_lines_are_scanned() {
    let c = classifier();
    let mut tail = lines(&["Error: unauthorized"]);
    tail.extend((0..SCAN_LINES).map(|i| format!("progress {i}")));
    assert_eq!(
        c.classify(CliType::Claude, 1, TerminalReason::Normal, &tail),
        FailureCategory::Retryable
    );

    tail.push("Error: unauthorized".to_string());
    assert_eq!(
        c.classify(CliType::Claude, 1, TerminalReason::Normal, &tail),
        FailureCategory::Fatal
    );
}

#[test]
fn custom_patterns_extend_detection() {
    let mut config = RateLimitConfig::default();
    config
        .patterns
        .insert("open_code".to_string(), vec![r"(?i)slow down".to_string()]);
    let c = ErrorClassifier::from_config(&config).unwrap();
    let tail = lines(&["provider says: slow down"]);
    assert!(c
        .classify(CliType::OpenCode, 1, TerminalReason::Normal, &tail)
        .is_rate_limit());
}

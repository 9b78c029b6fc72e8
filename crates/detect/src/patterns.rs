//! Pattern lane: fast regex rules keyed to severity bands.

use std::collections::VecDeque;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use platform::LogEvent;
use store::{RecommendedAction, Severity};

/// Window for counting repeated timeout signals.
const TIMEOUT_WINDOW_SECS: i64 = 60;

/// Hits required inside the window before timeouts escalate.
const TIMEOUT_HIT_THRESHOLD: usize = 3;

/// A pattern-lane match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternHit {
    pub severity: Severity,
    pub rule: &'static str,
    pub recommended_action: RecommendedAction,
    pub root_cause: &'static str,
}

fn oom() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)fatal|panic|\boom\b|out of memory|killed by oom").expect("oom regex")
    })
}

fn connection() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)econnrefused|connection refused|tls handshake failed")
            .expect("connection regex")
    })
}

fn server_error() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)http 5\d\d|internal server error|exception|traceback|stack ?trace")
            .expect("server error regex")
    })
}

fn timeout() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)timeout|deadline exceeded").expect("timeout regex"))
}

/// Stateless rule set; timeout counting state lives with the caller's
/// per-service window.
#[derive(Debug, Default)]
pub struct PatternLane;

impl PatternLane {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Evaluate one event. `timeout_hits` is the per-service sliding record
    /// of recent timeout signals, pruned here.
    pub fn evaluate(
        &self,
        event: &LogEvent,
        timeout_hits: &mut VecDeque<DateTime<Utc>>,
    ) -> Option<PatternHit> {
        let message = &event.message;

        if oom().is_match(message) {
            return Some(PatternHit {
                severity: Severity::Critical,
                rule: "oom",
                recommended_action: RecommendedAction::ScaleMemory,
                root_cause: "process killed or crashed (OOM / panic signature)",
            });
        }

        if connection().is_match(message) {
            return Some(PatternHit {
                severity: Severity::High,
                rule: "connection",
                recommended_action: RecommendedAction::Restart,
                root_cause: "downstream connection failures",
            });
        }

        if server_error().is_match(message) {
            return Some(PatternHit {
                severity: Severity::High,
                rule: "server_error",
                recommended_action: RecommendedAction::ManualFix,
                root_cause: "unhandled server errors in request path",
            });
        }

        if timeout().is_match(message) {
            let now = event.timestamp;
            timeout_hits.push_back(now);
            let horizon = now - Duration::seconds(TIMEOUT_WINDOW_SECS);
            while timeout_hits.front().is_some_and(|t| *t < horizon) {
                timeout_hits.pop_front();
            }

            if timeout_hits.len() >= TIMEOUT_HIT_THRESHOLD {
                return Some(PatternHit {
                    severity: Severity::Medium,
                    rule: "timeout_burst",
                    recommended_action: RecommendedAction::Restart,
                    root_cause: "repeated timeouts / deadline overruns",
                });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platform::LogLevel;
    use std::collections::HashMap;

    fn event(level: LogLevel, message: &str) -> LogEvent {
        LogEvent {
            service_id: "svc-1".to_string(),
            environment_id: None,
            service_name: None,
            timestamp: Utc::now(),
            level,
            severity_score: level.score(),
            message: message.to_string(),
            raw_metadata: HashMap::new(),
            source: None,
        }
    }

    #[test]
    fn oom_is_critical() {
        let lane = PatternLane::new();
        let mut hits = VecDeque::new();
        let hit = lane
            .evaluate(
                &event(
                    LogLevel::Fatal,
                    "FATAL: Out of memory - killed by OOM killer",
                ),
                &mut hits,
            )
            .unwrap();
        assert_eq!(hit.severity, Severity::Critical);
        assert_eq!(hit.recommended_action, RecommendedAction::ScaleMemory);
    }

    #[test]
    fn connection_refused_is_high() {
        let lane = PatternLane::new();
        let mut hits = VecDeque::new();
        let hit = lane
            .evaluate(
                &event(LogLevel::Error, "connect ECONNREFUSED 10.0.0.5:5432"),
                &mut hits,
            )
            .unwrap();
        assert_eq!(hit.severity, Severity::High);
        assert_eq!(hit.rule, "connection");
    }

    #[test]
    fn http_500_is_high() {
        let lane = PatternLane::new();
        let mut hits = VecDeque::new();
        let hit = lane
            .evaluate(&event(LogLevel::Error, "HTTP 503 from upstream"), &mut hits)
            .unwrap();
        assert_eq!(hit.severity, Severity::High);
    }

    #[test]
    fn single_timeout_does_not_escalate() {
        let lane = PatternLane::new();
        let mut hits = VecDeque::new();
        assert!(lane
            .evaluate(&event(LogLevel::Warn, "request timeout"), &mut hits)
            .is_none());
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn timeout_burst_escalates_to_medium() {
        let lane = PatternLane::new();
        let mut hits = VecDeque::new();
        lane.evaluate(&event(LogLevel::Warn, "timeout a"), &mut hits);
        lane.evaluate(&event(LogLevel::Warn, "deadline exceeded"), &mut hits);
        let hit = lane
            .evaluate(&event(LogLevel::Warn, "timeout c"), &mut hits)
            .unwrap();
        assert_eq!(hit.severity, Severity::Medium);
        assert_eq!(hit.rule, "timeout_burst");
    }

    #[test]
    fn stale_timeout_hits_are_pruned() {
        let lane = PatternLane::new();
        let mut hits = VecDeque::new();
        // Two old hits outside the 60s window.
        hits.push_back(Utc::now() - Duration::seconds(120));
        hits.push_back(Utc::now() - Duration::seconds(90));

        assert!(lane
            .evaluate(&event(LogLevel::Warn, "timeout again"), &mut hits)
            .is_none());
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn plain_warn_noise_matches_nothing() {
        let lane = PatternLane::new();
        let mut hits = VecDeque::new();
        assert!(lane
            .evaluate(
                &event(LogLevel::Warn, "cache miss ratio above expected"),
                &mut hits
            )
            .is_none());
        assert!(lane
            .evaluate(
                &event(LogLevel::Info, "Starting server on port 4000"),
                &mut hits
            )
            .is_none());
    }
}

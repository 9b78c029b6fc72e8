//! Per-service sliding window state.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};

use platform::LogEvent;

use crate::patterns::PatternHit;

/// Default window size.
pub const DEFAULT_WINDOW_SIZE: usize = 20;

/// Severity score at or above which the LLM lane is considered.
pub const LLM_TRIGGER_SCORE: u8 = 4;

/// The most recent events for one service plus the detection bookkeeping
/// attached to them.
#[derive(Debug)]
pub struct ServiceWindow {
    capacity: usize,
    pub events: VecDeque<LogEvent>,
    /// Recent timeout-signal timestamps for the burst rule.
    pub timeout_hits: VecDeque<DateTime<Utc>>,
    /// Best pattern hit still represented in the window; the LLM fallback.
    pub last_pattern: Option<PatternHit>,
    /// When the current tumbling batch closes.
    pub batch_deadline: Option<Instant>,
    /// An LLM classification is in flight (single-flight per service).
    pub inflight: bool,
    /// A trigger arrived while in flight; re-arm after completion.
    pub retrigger: bool,
    /// Friendliest known name for the service.
    pub service_name: Option<String>,
}

impl ServiceWindow {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: VecDeque::with_capacity(capacity.max(1)),
            timeout_hits: VecDeque::new(),
            last_pattern: None,
            batch_deadline: None,
            inflight: false,
            retrigger: false,
            service_name: None,
        }
    }

    /// Append an event, evicting the oldest beyond capacity.
    pub fn push(&mut self, event: LogEvent) {
        if let Some(name) = &event.service_name {
            self.service_name = Some(name.clone());
        }
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Whether the window currently qualifies for the LLM lane.
    #[must_use]
    pub fn qualifies_for_llm(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.severity_score >= LLM_TRIGGER_SCORE)
    }

    /// The event a candidate should be anchored to: the most recent event
    /// of the highest severity in the window.
    #[must_use]
    pub fn anchor_event(&self) -> Option<&LogEvent> {
        let max_score = self.events.iter().map(|e| e.severity_score).max()?;
        self.events
            .iter()
            .rev()
            .find(|e| e.severity_score == max_score)
    }

    /// Clone the window contents for a classification batch.
    #[must_use]
    pub fn batch(&self) -> Vec<LogEvent> {
        self.events.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platform::LogLevel;
    use std::collections::HashMap;

    fn event(message: &str, level: LogLevel) -> LogEvent {
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
    fn window_evicts_oldest() {
        let mut window = ServiceWindow::new(3);
        for i in 0..5 {
            window.push(event(&format!("msg {i}"), LogLevel::Info));
        }
        assert_eq!(window.events.len(), 3);
        assert_eq!(window.events.front().unwrap().message, "msg 2");
    }

    #[test]
    fn llm_qualification_needs_an_error() {
        let mut window = ServiceWindow::new(20);
        window.push(event("all fine", LogLevel::Info));
        assert!(!window.qualifies_for_llm());

        window.push(event("boom", LogLevel::Error));
        assert!(window.qualifies_for_llm());
    }

    #[test]
    fn anchor_is_most_recent_highest_severity() {
        let mut window = ServiceWindow::new(20);
        window.push(event("first error", LogLevel::Error));
        window.push(event("some info", LogLevel::Info));
        window.push(event("second error", LogLevel::Error));

        assert_eq!(window.anchor_event().unwrap().message, "second error");
    }

    #[test]
    fn empty_window_has_no_anchor() {
        let window = ServiceWindow::new(20);
        assert!(window.anchor_event().is_none());
    }
}

//! Log events, monitoring targets, and subscription state snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum stored length of a log message.
pub const MAX_MESSAGE_CHARS: usize = 10_000;

/// Log level, clamped on ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    /// Clamp an arbitrary severity string to the level enum.
    ///
    /// Unknown values map to `info` so a platform-side vocabulary change
    /// cannot drop events.
    #[must_use]
    pub fn clamp(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" | "err" => Self::Error,
            "fatal" | "panic" | "critical" => Self::Fatal,
            _ => Self::Info,
        }
    }

    /// Severity score in `[1..5]`.
    #[must_use]
    pub const fn score(self) -> u8 {
        match self {
            Self::Debug => 1,
            Self::Info => 2,
            Self::Warn => 3,
            Self::Error => 4,
            Self::Fatal => 5,
        }
    }
}

/// A normalized log event flowing from a subscription to the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub service_id: String,
    pub environment_id: Option<String>,
    pub service_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub severity_score: u8,
    #[serde(default)]
    pub raw_metadata: HashMap<String, serde_json::Value>,
    pub source: Option<String>,
}

/// A subscription target: one environment, optionally narrowed to one
/// service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitoringTarget {
    pub project_id: String,
    pub environment_id: String,
    pub service_id: Option<String>,
}

impl MonitoringTarget {
    #[must_use]
    pub fn key(&self) -> String {
        match &self.service_id {
            Some(service) => format!(
                "{}/{}/{}",
                self.project_id, self.environment_id, service
            ),
            None => format!("{}/{}", self.project_id, self.environment_id),
        }
    }

    /// Cartesian expansion of projects x environments x services. An empty
    /// service list yields one env-wide target per pair.
    #[must_use]
    pub fn expand(
        projects: &[String],
        environments: &[String],
        services: &[String],
    ) -> Vec<Self> {
        let mut targets = Vec::new();
        for project in projects {
            for environment in environments {
                if services.is_empty() {
                    targets.push(Self {
                        project_id: project.clone(),
                        environment_id: environment.clone(),
                        service_id: None,
                    });
                } else {
                    for service in services {
                        targets.push(Self {
                            project_id: project.clone(),
                            environment_id: environment.clone(),
                            service_id: Some(service.clone()),
                        });
                    }
                }
            }
        }
        targets
    }
}

impl std::fmt::Display for MonitoringTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Connection status of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Snapshot of one subscription's state machine.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionState {
    pub status: SubscriptionStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connection_attempts: u32,
    pub backoff_ms: u64,
    pub last_error: Option<String>,
    pub active_subscriptions: usize,
    pub events_received: u64,
    pub events_dropped: u64,
}

impl Default for SubscriptionState {
    fn default() -> Self {
        Self {
            status: SubscriptionStatus::Disconnected,
            last_heartbeat: None,
            connection_attempts: 0,
            backoff_ms: crate::subscription::BACKOFF_FLOOR_MS,
            last_error: None,
            active_subscriptions: 0,
            events_received: 0,
            events_dropped: 0,
        }
    }
}

/// Supervisor-level view of one target.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub target: String,
    pub alive: bool,
    pub connected: bool,
    pub connection_attempts: u32,
    pub events_received: u64,
    pub events_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_clamping() {
        assert_eq!(LogLevel::clamp("ERROR"), LogLevel::Error);
        assert_eq!(LogLevel::clamp("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::clamp("panic"), LogLevel::Fatal);
        assert_eq!(LogLevel::clamp("notice"), LogLevel::Info);
        assert_eq!(LogLevel::clamp(""), LogLevel::Info);
    }

    #[test]
    fn severity_scores() {
        assert_eq!(LogLevel::Debug.score(), 1);
        assert_eq!(LogLevel::Info.score(), 2);
        assert_eq!(LogLevel::Warn.score(), 3);
        assert_eq!(LogLevel::Error.score(), 4);
        assert_eq!(LogLevel::Fatal.score(), 5);
    }

    #[test]
    fn target_expansion_without_services() {
        let targets = MonitoringTarget::expand(
            &["p1".into(), "p2".into()],
            &["production".into()],
            &[],
        );
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.service_id.is_none()));
    }

    #[test]
    fn target_expansion_with_services() {
        let targets = MonitoringTarget::expand(
            &["p1".into()],
            &["production".into(), "staging".into()],
            &["svc-a".into(), "svc-b".into()],
        );
        assert_eq!(targets.len(), 4);
        assert_eq!(targets[0].key(), "p1/production/svc-a");
    }
}

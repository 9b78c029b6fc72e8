//! Persisted entity types and their string-tagged enums.
//!
//! Every enum persisted to the database round-trips through `as_str` /
//! `parse`, and rows are validated on the way in. Unknown tags coming out
//! of the database are a corruption signal and surface as
//! [`StoreError::InvalidEnum`](crate::StoreError::InvalidEnum).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{StoreError, StoreResult};

/// Incident severity, ordered from most to least urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(StoreError::InvalidEnum {
                kind: "severity",
                value: other.to_string(),
            }),
        }
    }

    /// Numeric rank for comparisons; higher is more urgent.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Critical => 4,
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }
}

/// Incident lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Detected,
    AwaitingAction,
    AutoRemediated,
    ManualResolved,
    Failed,
    Ignored,
}

impl IncidentStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::AwaitingAction => "awaiting_action",
            Self::AutoRemediated => "auto_remediated",
            Self::ManualResolved => "manual_resolved",
            Self::Failed => "failed",
            Self::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "detected" => Ok(Self::Detected),
            "awaiting_action" => Ok(Self::AwaitingAction),
            "auto_remediated" => Ok(Self::AutoRemediated),
            "manual_resolved" => Ok(Self::ManualResolved),
            "failed" => Ok(Self::Failed),
            "ignored" => Ok(Self::Ignored),
            other => Err(StoreError::InvalidEnum {
                kind: "incident_status",
                value: other.to_string(),
            }),
        }
    }

    /// Terminal statuses are never reopened by the detector.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::AutoRemediated | Self::ManualResolved | Self::Ignored
        )
    }

    /// Whether the transition `self -> to` is permitted.
    ///
    /// The edge set is deliberately closed: anything not listed here is an
    /// invalid transition, including self-loops.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Detected, Self::AwaitingAction)
                | (Self::Detected, Self::Ignored)
                | (Self::AwaitingAction, Self::AutoRemediated)
                | (Self::AwaitingAction, Self::Failed)
                | (Self::Failed, Self::Detected)
                | (Self::Detected, Self::ManualResolved)
                | (Self::AwaitingAction, Self::ManualResolved)
                | (Self::Failed, Self::ManualResolved)
                | (Self::AutoRemediated, Self::ManualResolved)
                | (Self::Ignored, Self::ManualResolved)
        )
    }
}

/// Action the detector recommends for an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Restart,
    Redeploy,
    ScaleMemory,
    ScaleReplicas,
    Rollback,
    Stop,
    Diagnostic,
    ManualFix,
    None,
}

impl RecommendedAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Redeploy => "redeploy",
            Self::ScaleMemory => "scale_memory",
            Self::ScaleReplicas => "scale_replicas",
            Self::Rollback => "rollback",
            Self::Stop => "stop",
            Self::Diagnostic => "diagnostic",
            Self::ManualFix => "manual_fix",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "restart" => Ok(Self::Restart),
            "redeploy" => Ok(Self::Redeploy),
            "scale_memory" => Ok(Self::ScaleMemory),
            "scale_replicas" => Ok(Self::ScaleReplicas),
            "rollback" => Ok(Self::Rollback),
            "stop" => Ok(Self::Stop),
            "diagnostic" => Ok(Self::Diagnostic),
            "manual_fix" => Ok(Self::ManualFix),
            "none" => Ok(Self::None),
            other => Err(StoreError::InvalidEnum {
                kind: "recommended_action",
                value: other.to_string(),
            }),
        }
    }
}

/// Remediation action status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl ActionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidEnum {
                kind: "action_status",
                value: other.to_string(),
            }),
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Who asked for a remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitiatorType {
    Automated,
    User,
}

impl InitiatorType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Automated => "automated",
            Self::User => "user",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "automated" => Ok(Self::Automated),
            "user" => Ok(Self::User),
            other => Err(StoreError::InvalidEnum {
                kind: "initiator_type",
                value: other.to_string(),
            }),
        }
    }
}

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(StoreError::InvalidEnum {
                kind: "message_role",
                value: other.to_string(),
            }),
        }
    }
}

/// Preferred LLM provider for a service's incident analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderPref {
    Openai,
    Anthropic,
    Auto,
}

impl LlmProviderPref {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "openai" => Ok(Self::Openai),
            "anthropic" => Ok(Self::Anthropic),
            "auto" => Ok(Self::Auto),
            other => Err(StoreError::InvalidEnum {
                kind: "llm_provider",
                value: other.to_string(),
            }),
        }
    }
}

/// Per-service remediation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePolicy {
    pub service_id: String,
    pub service_name: String,
    pub auto_remediation_enabled: bool,
    pub default_memory_mb: Option<i64>,
    pub default_replicas: Option<i64>,
    pub llm_provider: LlmProviderPref,
    pub confidence_threshold: f64,
    pub updated_at: DateTime<Utc>,
}

impl ServicePolicy {
    /// Policy applied to a service seen for the first time: nothing is
    /// auto-remediated until an operator opts in.
    #[must_use]
    pub fn defaults_for(service_id: &str, service_name: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            service_name: service_name.to_string(),
            auto_remediation_enabled: false,
            default_memory_mb: None,
            default_replicas: None,
            llm_provider: LlmProviderPref::Auto,
            confidence_threshold: 0.8,
            updated_at: Utc::now(),
        }
    }
}

/// A deduplicated production incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub service_id: String,
    pub service_name: String,
    pub environment_id: Option<String>,
    pub fingerprint: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub confidence: f64,
    pub root_cause: Option<String>,
    pub recommended_action: RecommendedAction,
    pub reasoning: Option<String>,
    pub log_context: Value,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

/// Mutable fields of an incident candidate produced by the detector.
///
/// The store owns id, status and timestamps; the detector supplies the
/// rest.
#[derive(Debug, Clone)]
pub struct IncidentDraft {
    pub service_id: String,
    pub service_name: String,
    pub environment_id: Option<String>,
    pub fingerprint: String,
    pub severity: Severity,
    pub confidence: f64,
    pub root_cause: Option<String>,
    pub recommended_action: RecommendedAction,
    pub reasoning: Option<String>,
    pub log_context: Value,
    pub metadata: Value,
}

/// Result of an incident upsert.
#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    /// A new incident row was inserted.
    Created(Incident),
    /// An open incident was refreshed with the new signal.
    Updated(Incident),
    /// The incident is terminal or ignored; nothing was written.
    Skipped(Incident),
}

impl UpsertOutcome {
    #[must_use]
    pub const fn incident(&self) -> &Incident {
        match self {
            Self::Created(i) | Self::Updated(i) | Self::Skipped(i) => i,
        }
    }

    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

/// A side-effecting remediation against the hosting platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub initiator_type: InitiatorType,
    pub initiator_ref: Option<String>,
    pub action_type: RecommendedAction,
    pub parameters: Value,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ActionStatus,
    pub result_message: Option<String>,
    pub failure_reason: Option<String>,
}

/// A chat-thread conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: Uuid,
    pub incident_id: Option<Uuid>,
    pub channel: String,
    pub channel_ref: String,
    pub participant_id: String,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub context: Value,
}

/// A single message within a conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub action_ref: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_round_trips() {
        for s in [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
        ] {
            assert_eq!(Severity::parse(s.as_str()).unwrap(), s);
        }
        assert!(Severity::parse("catastrophic").is_err());
    }

    #[test]
    fn status_round_trips() {
        for s in [
            IncidentStatus::Detected,
            IncidentStatus::AwaitingAction,
            IncidentStatus::AutoRemediated,
            IncidentStatus::ManualResolved,
            IncidentStatus::Failed,
            IncidentStatus::Ignored,
        ] {
            assert_eq!(IncidentStatus::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn transition_edges() {
        use IncidentStatus::*;

        assert!(Detected.can_transition_to(AwaitingAction));
        assert!(Detected.can_transition_to(Ignored));
        assert!(AwaitingAction.can_transition_to(AutoRemediated));
        assert!(AwaitingAction.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Detected));
        assert!(AutoRemediated.can_transition_to(ManualResolved));

        // No reopening of terminal incidents, no self-loops.
        assert!(!AutoRemediated.can_transition_to(Detected));
        assert!(!Ignored.can_transition_to(AwaitingAction));
        assert!(!Detected.can_transition_to(Detected));
        assert!(!ManualResolved.can_transition_to(ManualResolved));
    }

    #[test]
    fn terminal_statuses() {
        assert!(IncidentStatus::AutoRemediated.is_terminal());
        assert!(IncidentStatus::ManualResolved.is_terminal());
        assert!(IncidentStatus::Ignored.is_terminal());
        assert!(!IncidentStatus::Detected.is_terminal());
        assert!(!IncidentStatus::Failed.is_terminal());
    }

    #[test]
    fn default_policy_is_conservative() {
        let policy = ServicePolicy::defaults_for("svc-1", "api");
        assert!(!policy.auto_remediation_enabled);
        assert!((policy.confidence_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(policy.llm_provider, LlmProviderPref::Auto);
    }

    #[test]
    fn severity_ordering_by_rank() {
        assert!(Severity::Critical.rank() > Severity::High.rank());
        assert!(Severity::High.rank() > Severity::Medium.rank());
        assert!(Severity::Medium.rank() > Severity::Low.rank());
    }
}

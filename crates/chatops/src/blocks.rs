//! Block Kit rendering for incident alerts.

use serde::Serialize;

use store::{Incident, Severity};

/// A Block Kit block.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Header {
        text: Text,
    },
    Section {
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<Text>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fields: Option<Vec<Text>>,
    },
    Divider,
    Context {
        elements: Vec<Text>,
    },
    Actions {
        elements: Vec<Element>,
    },
}

/// A Block Kit text object.
#[derive(Debug, Clone, Serialize)]
pub struct Text {
    #[serde(rename = "type")]
    text_type: &'static str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    emoji: Option<bool>,
}

impl Text {
    pub fn mrkdwn(text: impl Into<String>) -> Self {
        Self {
            text_type: "mrkdwn",
            text: text.into(),
            emoji: None,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text_type: "plain_text",
            text: text.into(),
            emoji: Some(true),
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.text
    }
}

/// An interactive element.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Element {
    Button {
        text: Text,
        action_id: String,
        value: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        style: Option<&'static str>,
    },
}

impl Element {
    fn button(label: &str, action_id: &str, value: String, style: Option<&'static str>) -> Self {
        Self::Button {
            text: Text::plain(label),
            action_id: action_id.to_string(),
            value,
            style,
        }
    }
}

/// Severity presentation.
#[must_use]
pub const fn severity_emoji(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => ":red_circle:",
        Severity::High => ":large_orange_circle:",
        Severity::Medium => ":large_yellow_circle:",
        Severity::Low => ":large_blue_circle:",
    }
}

/// Attachment color strip per severity.
#[must_use]
pub const fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "#e74c3c",
        Severity::High => "#f39c12",
        Severity::Medium => "#f1c40f",
        Severity::Low => "#3498db",
    }
}

/// Render the alert for a freshly detected incident.
///
/// The action row carries opaque `"<action>:<incident_id>"` values; the
/// interactive webhook parses them back.
#[must_use]
pub fn incident_alert(incident: &Incident) -> Vec<Block> {
    let confidence_pct = (incident.confidence * 100.0).round() as u32;

    let mut blocks = vec![
        Block::Header {
            text: Text::plain(format!(
                "{} Incident: {}",
                severity_emoji(incident.severity),
                incident.service_name
            )),
        },
        Block::Section {
            text: None,
            fields: Some(vec![
                Text::mrkdwn(format!("*Service:*\n{}", incident.service_name)),
                Text::mrkdwn(format!(
                    "*Severity:*\n{}",
                    incident.severity.as_str()
                )),
                Text::mrkdwn(format!("*Confidence:*\n{confidence_pct}%")),
                Text::mrkdwn(format!(
                    "*Detected:*\n{}",
                    incident.detected_at.format("%Y-%m-%d %H:%M:%S UTC")
                )),
            ]),
        },
    ];

    let root_cause = incident
        .root_cause
        .as_deref()
        .unwrap_or("not yet determined");
    blocks.push(Block::Section {
        text: Some(Text::mrkdwn(format!(
            "*Root cause:* {root_cause}\n*Recommended action:* `{}`",
            incident.recommended_action.as_str()
        ))),
        fields: None,
    });

    blocks.push(Block::Actions {
        elements: vec![
            Element::button(
                "Auto-Fix",
                "auto_fix",
                format!("auto_fix:{}", incident.id),
                Some("primary"),
            ),
            Element::button(
                "Start Chat",
                "start_chat",
                format!("start_chat:{}", incident.id),
                None,
            ),
            Element::button(
                "Ignore",
                "ignore",
                format!("ignore:{}", incident.id),
                Some("danger"),
            ),
        ],
    });

    blocks.push(Block::Context {
        elements: vec![Text::mrkdwn(format!(
            "railguard • fingerprint `{}`",
            incident.fingerprint
        ))],
    });

    blocks
}

/// Render the confirmation message posted after an Auto-Fix press.
#[must_use]
pub fn confirmation_blocks(incident: &Incident, refined_summary: &str) -> Vec<Block> {
    vec![
        Block::Section {
            text: Some(Text::mrkdwn(format!(
                "*Confirm remediation for {}*\n{refined_summary}",
                incident.service_name
            ))),
            fields: None,
        },
        Block::Actions {
            elements: vec![
                Element::button(
                    "Confirm",
                    "confirm_auto_fix",
                    format!(
                        "confirm:{}:{}",
                        incident.id,
                        incident.recommended_action.as_str()
                    ),
                    Some("primary"),
                ),
                Element::button(
                    "Cancel",
                    "cancel_auto_fix",
                    format!("cancel:{}", incident.id),
                    Some("danger"),
                ),
            ],
        },
    ]
}

/// Plain fallback text for notification previews.
#[must_use]
pub fn alert_fallback(incident: &Incident) -> String {
    format!(
        "[{}] incident on {}: {}",
        incident.severity.as_str(),
        incident.service_name,
        incident.root_cause.as_deref().unwrap_or("cause unknown")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use store::{IncidentStatus, RecommendedAction};
    use uuid::Uuid;

    fn incident(severity: Severity) -> Incident {
        Incident {
            id: Uuid::new_v4(),
            service_id: "svc-1".to_string(),
            service_name: "api".to_string(),
            environment_id: Some("env-1".to_string()),
            fingerprint: "abcd1234abcd1234".to_string(),
            severity,
            status: IncidentStatus::Detected,
            confidence: 0.87,
            root_cause: Some("out of memory".to_string()),
            recommended_action: RecommendedAction::Restart,
            reasoning: None,
            log_context: json!({}),
            detected_at: Utc::now(),
            resolved_at: None,
            metadata: json!({}),
        }
    }

    #[test]
    fn alert_preserves_required_fields_for_all_severities() {
        for severity in [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
        ] {
            let incident = incident(severity);
            let blocks = incident_alert(&incident);
            let rendered = serde_json::to_string(&blocks).unwrap();

            assert!(rendered.contains("api"), "service name for {severity:?}");
            assert!(
                rendered.contains(severity.as_str()),
                "severity tag for {severity:?}"
            );
            assert!(rendered.contains("87%"), "confidence for {severity:?}");
            assert!(rendered.contains("out of memory"));
            assert!(rendered.contains("restart"));
        }
    }

    #[test]
    fn action_values_carry_the_incident_id() {
        let incident = incident(Severity::High);
        let blocks = incident_alert(&incident);
        let rendered = serde_json::to_string(&blocks).unwrap();

        assert!(rendered.contains(&format!("auto_fix:{}", incident.id)));
        assert!(rendered.contains(&format!("start_chat:{}", incident.id)));
        assert!(rendered.contains(&format!("ignore:{}", incident.id)));
    }

    #[test]
    fn confirmation_encodes_action_name() {
        let incident = incident(Severity::High);
        let blocks = confirmation_blocks(&incident, "Restart looks safe.");
        let rendered = serde_json::to_string(&blocks).unwrap();
        assert!(rendered.contains(&format!("confirm:{}:restart", incident.id)));
        assert!(rendered.contains(&format!("cancel:{}", incident.id)));
    }

    #[test]
    fn blocks_serialize_with_slack_type_tags() {
        let incident = incident(Severity::Critical);
        let blocks = incident_alert(&incident);
        let value = serde_json::to_value(&blocks).unwrap();
        assert_eq!(value[0]["type"], "header");
        let types: Vec<&str> = value
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["type"].as_str().unwrap())
            .collect();
        assert!(types.contains(&"actions"));
        assert!(types.contains(&"context"));
    }
}

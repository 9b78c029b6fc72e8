//! Slack notifier: posts incident alerts and threaded progress updates
//! via the Web API.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use store::Incident;

use crate::blocks::{self, Block};
use crate::{ChatError, ChatResult};

/// Slack Web API endpoint for posting messages.
const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

/// Chat posts get a tight timeout; a slow Slack must not stall the
/// pipeline.
const POST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocks: Option<&'a [Block]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_ts: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachments: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Posts alerts and updates to the configured channel.
///
/// Unconfigured (missing token or channel) is a first-class state: every
/// operation returns [`ChatError::NotConfigured`] and callers treat that
/// as "chat disabled", not as a pipeline failure.
#[derive(Clone)]
pub struct SlackNotifier {
    token: Option<String>,
    channel_id: Option<String>,
    http: reqwest::Client,
    base_url: String,
}

impl SlackNotifier {
    #[must_use]
    pub fn new(token: Option<String>, channel_id: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(POST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            token,
            channel_id,
            http,
            base_url: POST_MESSAGE_URL.to_string(),
        }
    }

    /// Override the endpoint (tests).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Whether both the bot token and the alert channel are configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.token.is_some() && self.channel_id.is_some()
    }

    fn credentials(&self) -> ChatResult<(&str, &str)> {
        match (&self.token, &self.channel_id) {
            (Some(token), Some(channel)) => Ok((token, channel)),
            _ => Err(ChatError::NotConfigured),
        }
    }

    async fn post(
        &self,
        text: &str,
        message_blocks: Option<&[Block]>,
        thread_ts: Option<&str>,
        color: Option<&str>,
    ) -> ChatResult<String> {
        let (token, channel) = self.credentials()?;

        let attachments =
            color.map(|c| json!([{ "color": c, "fallback": text }]));
        let request = PostMessageRequest {
            channel,
            text,
            blocks: message_blocks,
            thread_ts,
            attachments,
        };

        let response = self
            .http
            .post(&self.base_url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await?;

        if response.status().as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            warn!(retry_after_secs, "Rate limited by Slack");
            return Err(ChatError::RateLimited { retry_after_secs });
        }

        let parsed: PostMessageResponse = response.json().await?;
        if !parsed.ok {
            let reason = parsed.error.unwrap_or_else(|| "unknown_error".to_string());
            warn!(error = %reason, "Slack rejected the message");
            return Err(ChatError::Slack(reason));
        }

        let ts = parsed
            .ts
            .ok_or_else(|| ChatError::Slack("response without ts".to_string()))?;
        debug!(ts = %ts, threaded = thread_ts.is_some(), "Slack message posted");
        Ok(ts)
    }

    /// Post the block-structured alert for a new incident. Returns the
    /// message `ts`, which becomes the incident's thread.
    pub async fn send_incident_alert(&self, incident: &Incident) -> ChatResult<String> {
        let rendered = blocks::incident_alert(incident);
        let fallback = blocks::alert_fallback(incident);
        self.post(
            &fallback,
            Some(&rendered),
            None,
            Some(blocks::severity_color(incident.severity)),
        )
        .await
    }

    /// Post the auto-fix confirmation into the incident thread.
    pub async fn send_confirmation(
        &self,
        incident: &Incident,
        thread_ts: &str,
        refined_summary: &str,
    ) -> ChatResult<String> {
        let rendered = blocks::confirmation_blocks(incident, refined_summary);
        self.post(
            "Confirm remediation",
            Some(&rendered),
            Some(thread_ts),
            None,
        )
        .await
    }

    /// Plain threaded reply.
    pub async fn post_thread_reply(&self, thread_ts: &str, text: &str) -> ChatResult<String> {
        self.post(text, None, Some(thread_ts), None).await
    }

    /// Un-threaded message to the alert channel.
    pub async fn post_channel_message(&self, text: &str) -> ChatResult<String> {
        self.post(text, None, None, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use store::{IncidentStatus, RecommendedAction, Severity};
    use uuid::Uuid;

    fn incident() -> Incident {
        Incident {
            id: Uuid::new_v4(),
            service_id: "svc-1".to_string(),
            service_name: "api".to_string(),
            environment_id: None,
            fingerprint: "fp".to_string(),
            severity: Severity::High,
            status: IncidentStatus::Detected,
            confidence: 0.9,
            root_cause: None,
            recommended_action: RecommendedAction::Restart,
            reasoning: None,
            log_context: serde_json::json!({}),
            detected_at: Utc::now(),
            resolved_at: None,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn unconfigured_notifier_fails_fast() {
        let notifier = SlackNotifier::new(None, None);
        assert!(!notifier.is_configured());

        let err = notifier.send_incident_alert(&incident()).await.unwrap_err();
        assert!(matches!(err, ChatError::NotConfigured));

        let err = notifier.post_thread_reply("1.0", "hello").await.unwrap_err();
        assert!(matches!(err, ChatError::NotConfigured));
    }

    #[tokio::test]
    async fn token_without_channel_is_unconfigured() {
        let notifier = SlackNotifier::new(Some("xoxb-1".to_string()), None);
        assert!(!notifier.is_configured());
    }
}

//! LLM lane: batched incident classification.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use ai::{AiMessage, AiResult, GenerateOptions, ProviderChoice, ProviderRegistry};
use platform::LogEvent;
use store::{RecommendedAction, Severity};

/// Structured judgment returned by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct Judgment {
    pub severity: Severity,
    #[serde(default)]
    pub root_cause: Option<String>,
    pub recommended_action: RecommendedAction,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Classifier seam; the production implementation calls an LLM, tests use
/// stubs.
#[async_trait]
pub trait IncidentClassifier: Send + Sync {
    async fn classify(
        &self,
        service_name: &str,
        events: &[LogEvent],
        choice: ProviderChoice,
    ) -> AiResult<Judgment>;
}

const SYSTEM_PROMPT: &str = "\
You are an SRE triaging production log windows for a deployed service. \
Respond with a single JSON object and nothing else:\n\
{\n\
  \"severity\": \"critical\" | \"high\" | \"medium\" | \"low\",\n\
  \"root_cause\": \"<one sentence>\",\n\
  \"recommended_action\": \"restart\" | \"redeploy\" | \"scale_memory\" | \
\"scale_replicas\" | \"rollback\" | \"stop\" | \"manual_fix\" | \"none\",\n\
  \"confidence\": <0.0-1.0>,\n\
  \"reasoning\": \"<one or two sentences>\"\n\
}\n\
Prefer \"none\" over guessing when the logs look like routine noise.";

/// Production classifier over the provider registry.
pub struct LlmClassifier {
    registry: Arc<ProviderRegistry>,
}

impl LlmClassifier {
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    fn build_prompt(service_name: &str, events: &[LogEvent]) -> String {
        use std::fmt::Write as _;

        let mut prompt = format!(
            "Service: {service_name}\nRecent log window ({} lines, newest last):\n",
            events.len()
        );
        for event in events {
            let _ = writeln!(
                prompt,
                "[{}] {} {}",
                event.timestamp.format("%H:%M:%S"),
                event.level.as_str(),
                event.message
            );
        }
        prompt.push_str("\nClassify this window.");
        prompt
    }
}

#[async_trait]
impl IncidentClassifier for LlmClassifier {
    async fn classify(
        &self,
        service_name: &str,
        events: &[LogEvent],
        choice: ProviderChoice,
    ) -> AiResult<Judgment> {
        let provider = self.registry.select(choice)?;
        debug!(
            provider = provider.name(),
            service = %service_name,
            events = events.len(),
            "Requesting LLM classification"
        );

        let messages = vec![
            AiMessage::system(SYSTEM_PROMPT),
            AiMessage::user(Self::build_prompt(service_name, events)),
        ];
        let options = GenerateOptions {
            temperature: Some(0.0),
            max_tokens: Some(512),
        };

        let response = provider.generate(&messages, &options).await?;
        let mut judgment: Judgment = ai::parse_json_response(&response)?;
        judgment.confidence = judgment.confidence.clamp(0.0, 1.0);
        Ok(judgment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use platform::LogLevel;
    use std::collections::HashMap;

    #[test]
    fn judgment_deserializes_from_model_output() {
        let raw = r#"{
            "severity": "high",
            "root_cause": "database connection pool exhausted",
            "recommended_action": "restart",
            "confidence": 0.85,
            "reasoning": "repeated ECONNREFUSED against the primary"
        }"#;
        let judgment: Judgment = serde_json::from_str(raw).unwrap();
        assert_eq!(judgment.severity, Severity::High);
        assert_eq!(judgment.recommended_action, RecommendedAction::Restart);
    }

    #[test]
    fn prompt_includes_each_line() {
        let events = vec![LogEvent {
            service_id: "svc-1".to_string(),
            environment_id: None,
            service_name: None,
            timestamp: Utc::now(),
            level: LogLevel::Error,
            severity_score: 4,
            message: "connection refused".to_string(),
            raw_metadata: HashMap::new(),
            source: None,
        }];
        let prompt = LlmClassifier::build_prompt("api", &events);
        assert!(prompt.contains("Service: api"));
        assert!(prompt.contains("connection refused"));
    }
}

//! Provider trait and common request/response types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{AiError, AiResult};

/// Role of a message in a model conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiRole {
    System,
    User,
    Assistant,
}

/// A message sent to (or received from) a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiMessage {
    pub role: AiRole,
    pub content: String,
}

impl AiMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: AiRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: AiRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: AiRole::Assistant,
            content: content.into(),
        }
    }
}

/// Generation parameters.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A model response.
#[derive(Debug, Clone)]
pub struct AiResponse {
    pub text: String,
    pub model: String,
    pub provider: &'static str,
}

/// Interface every LLM vendor implements.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Vendor name ("anthropic", "openai").
    fn name(&self) -> &'static str;

    /// Whether an API key is present.
    fn is_configured(&self) -> bool;

    /// Generate a completion for the given messages.
    async fn generate(
        &self,
        messages: &[AiMessage],
        options: &GenerateOptions,
    ) -> AiResult<AiResponse>;
}

/// Parse a model response as JSON, tolerating markdown code fences.
pub fn parse_json_response<T: for<'de> Deserialize<'de>>(response: &AiResponse) -> AiResult<T> {
    let text = response.text.trim();

    let json_text = if let Some(stripped) = text.strip_prefix("```json") {
        stripped.strip_suffix("```").unwrap_or(stripped).trim()
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped.strip_suffix("```").unwrap_or(stripped).trim()
    } else {
        text
    };

    serde_json::from_str(json_text)
        .map_err(|e| AiError::ParseFailure(format!("{e}; response: {text}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(text: &str) -> AiResponse {
        AiResponse {
            text: text.to_string(),
            model: "test".to_string(),
            provider: "test",
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Judgment {
        severity: String,
        confidence: f64,
    }

    #[test]
    fn parses_bare_json() {
        let parsed: Judgment =
            parse_json_response(&response(r#"{"severity": "high", "confidence": 0.9}"#)).unwrap();
        assert_eq!(parsed.severity, "high");
    }

    #[test]
    fn parses_fenced_json() {
        let text = "```json\n{\"severity\": \"critical\", \"confidence\": 0.95}\n```";
        let parsed: Judgment = parse_json_response(&response(text)).unwrap();
        assert_eq!(parsed.severity, "critical");
    }

    #[test]
    fn rejects_prose() {
        let err = parse_json_response::<Judgment>(&response("The service looks unhealthy."));
        assert!(err.is_err());
    }
}

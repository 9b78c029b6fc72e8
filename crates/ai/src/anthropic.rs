//! Anthropic Claude provider.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::provider::{AiMessage, AiProvider, AiResponse, AiRole, GenerateOptions};
use crate::{AiError, AiResult};

/// Anthropic API endpoint.
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default model for incident analysis.
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

/// Anthropic Claude provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl AnthropicProvider {
    /// Create a provider with an explicit API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            api_key: Some(api_key.into()),
            base_url: ANTHROPIC_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Create a provider from `ANTHROPIC_API_KEY`; unconfigured when absent.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            client: http_client(),
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            base_url: ANTHROPIC_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Override the endpoint (tests).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn convert_messages(messages: &[AiMessage]) -> (Option<String>, Vec<AnthropicMessage>) {
        let mut system = None;
        let mut converted = Vec::new();

        for msg in messages {
            match msg.role {
                // Anthropic takes the system prompt as a separate field.
                AiRole::System => system = Some(msg.content.clone()),
                AiRole::User => converted.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: msg.content.clone(),
                }),
                AiRole::Assistant => converted.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: msg.content.clone(),
                }),
            }
        }

        (system, converted)
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(
        &self,
        messages: &[AiMessage],
        options: &GenerateOptions,
    ) -> AiResult<AiResponse> {
        let api_key = self.api_key.as_ref().ok_or(AiError::NotConfigured)?;

        let (system, converted) = Self::convert_messages(messages);
        let request = AnthropicRequest {
            model: self.model.clone(),
            messages: converted,
            max_tokens: options.max_tokens.unwrap_or(1024),
            system,
            temperature: options.temperature,
        };

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| AiError::ProviderUnavailable {
                provider: "anthropic",
                reason: e.to_string(),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AiError::ProviderUnavailable {
                provider: "anthropic",
                reason: e.to_string(),
            })?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<AnthropicErrorResponse>(&body) {
                return Err(AiError::Api {
                    provider: "anthropic",
                    message: format!("{}: {}", err.error.error_type, err.error.message),
                });
            }
            return Err(AiError::Api {
                provider: "anthropic",
                message: format!("{status}: {body}"),
            });
        }

        let parsed: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| AiError::ParseFailure(format!("anthropic response: {e}")))?;

        let text = parsed
            .content
            .iter()
            .filter(|c| c.content_type == "text")
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        Ok(AiResponse {
            text,
            model: parsed.model,
            provider: "anthropic",
        })
    }
}

fn http_client() -> Client {
    Client::builder()
        .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_without_key() {
        let provider = AnthropicProvider {
            client: http_client(),
            api_key: None,
            base_url: ANTHROPIC_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        };
        assert!(!provider.is_configured());
    }

    #[test]
    fn system_message_is_lifted() {
        let messages = vec![
            AiMessage::system("You are an SRE."),
            AiMessage::user("Analyze these logs."),
        ];
        let (system, converted) = AnthropicProvider::convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("You are an SRE."));
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].role, "user");
    }
}

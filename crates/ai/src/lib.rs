//! LLM provider layer.
//!
//! One [`AiProvider`] trait, two vendor implementations, and a
//! [`ProviderRegistry`] that picks a provider per request (`auto` prefers
//! whichever vendor is configured, Anthropic first).

pub mod anthropic;
pub mod openai;
pub mod provider;
pub mod registry;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use provider::{
    parse_json_response, AiMessage, AiProvider, AiResponse, AiRole, GenerateOptions,
};
pub use registry::{ProviderChoice, ProviderRegistry};

use thiserror::Error;

/// Errors from the provider layer.
#[derive(Error, Debug)]
pub enum AiError {
    #[error("no LLM provider is configured (set ANTHROPIC_API_KEY or OPENAI_API_KEY)")]
    NotConfigured,

    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: &'static str, reason: String },

    #[error("provider '{provider}' returned an API error: {message}")]
    Api { provider: &'static str, message: String },

    #[error("failed to parse model output: {0}")]
    ParseFailure(String),
}

/// Result alias for provider operations.
pub type AiResult<T> = Result<T, AiError>;

//! Provider registry and per-request selection.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::provider::AiProvider;
use crate::{AiError, AiResult, AnthropicProvider, OpenAiProvider};

/// Which provider a caller wants for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderChoice {
    Openai,
    Anthropic,
    /// Whichever vendor is configured; Anthropic preferred.
    #[default]
    Auto,
}

impl ProviderChoice {
    /// Parse a configuration tag. Unknown tags fall back to `Auto`.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "openai" => Self::Openai,
            "anthropic" => Self::Anthropic,
            _ => Self::Auto,
        }
    }
}

/// Registry of available providers.
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn AiProvider>>,
}

impl ProviderRegistry {
    /// Empty registry, for tests that register stubs.
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registry with both vendors registered from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AnthropicProvider::from_env()));
        registry.register(Arc::new(OpenAiProvider::from_env()));

        let configured: Vec<&str> = registry
            .providers
            .values()
            .filter(|p| p.is_configured())
            .map(|p| p.name())
            .collect();
        if configured.is_empty() {
            info!("No LLM provider configured; detector will run pattern-only");
        } else {
            info!(providers = ?configured, "LLM providers configured");
        }

        registry
    }

    /// Register (or replace) a provider.
    pub fn register(&mut self, provider: Arc<dyn AiProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    /// Whether any provider has credentials.
    #[must_use]
    pub fn any_configured(&self) -> bool {
        self.providers.values().any(|p| p.is_configured())
    }

    /// Select a provider for the given preference.
    ///
    /// A named preference whose vendor is unconfigured falls back to any
    /// configured provider rather than failing the request.
    pub fn select(&self, choice: ProviderChoice) -> AiResult<Arc<dyn AiProvider>> {
        let named = match choice {
            ProviderChoice::Openai => self.configured("openai"),
            ProviderChoice::Anthropic => self.configured("anthropic"),
            ProviderChoice::Auto => None,
        };

        named
            .or_else(|| self.configured("anthropic"))
            .or_else(|| self.configured("openai"))
            .or_else(|| {
                self.providers
                    .values()
                    .find(|p| p.is_configured())
                    .cloned()
            })
            .ok_or(AiError::NotConfigured)
    }

    fn configured(&self, name: &str) -> Option<Arc<dyn AiProvider>> {
        self.providers
            .get(name)
            .filter(|p| p.is_configured())
            .cloned()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AiMessage, AiResponse, GenerateOptions};
    use async_trait::async_trait;

    struct StubProvider {
        name: &'static str,
        configured: bool,
    }

    #[async_trait]
    impl AiProvider for StubProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn generate(
            &self,
            _messages: &[AiMessage],
            _options: &GenerateOptions,
        ) -> AiResult<AiResponse> {
            Ok(AiResponse {
                text: "{}".to_string(),
                model: "stub".to_string(),
                provider: self.name,
            })
        }
    }

    #[test]
    fn auto_prefers_anthropic() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StubProvider {
            name: "anthropic",
            configured: true,
        }));
        registry.register(Arc::new(StubProvider {
            name: "openai",
            configured: true,
        }));

        let provider = registry.select(ProviderChoice::Auto).unwrap();
        assert_eq!(provider.name(), "anthropic");
    }

    #[test]
    fn named_preference_falls_back_when_unconfigured() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StubProvider {
            name: "anthropic",
            configured: false,
        }));
        registry.register(Arc::new(StubProvider {
            name: "openai",
            configured: true,
        }));

        let provider = registry.select(ProviderChoice::Anthropic).unwrap();
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn nothing_configured_is_an_error() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.select(ProviderChoice::Auto),
            Err(AiError::NotConfigured)
        ));
    }

    #[test]
    fn choice_parses_tags() {
        assert_eq!(ProviderChoice::from_tag("openai"), ProviderChoice::Openai);
        assert_eq!(
            ProviderChoice::from_tag("anthropic"),
            ProviderChoice::Anthropic
        );
        assert_eq!(ProviderChoice::from_tag("whatever"), ProviderChoice::Auto);
    }
}

use super::anthropic::AnthropicAdaptor;
use super::gemini::GeminiAdaptor;
use super::openai::OpenAIAdaptor;
use super::{Adaptor, AdaptorError, AdaptorResult};
use crate::model::ProviderType;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves a channel's provider type to its adaptor
#[derive(Clone, Default)]
pub struct AdaptorRegistry {
    adaptors: HashMap<ProviderType, Arc<dyn Adaptor>>,
}

impl AdaptorRegistry {
    /// Registry with no adaptors
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in protocol family
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(OpenAIAdaptor::new()));
        registry.register(Arc::new(AnthropicAdaptor::new()));
        registry.register(Arc::new(GeminiAdaptor::new()));
        registry
    }

    /// Add or replace the adaptor for its provider type
    pub fn register(&mut self, adaptor: Arc<dyn Adaptor>) {
        self.adaptors.insert(adaptor.provider_type(), adaptor);
    }

    pub fn get(&self, provider_type: ProviderType) -> AdaptorResult<Arc<dyn Adaptor>> {
        self.adaptors
            .get(&provider_type)
            .cloned()
            .ok_or(AdaptorError::MissingAdaptor(provider_type))
    }

    pub fn provider_types(&self) -> Vec<ProviderType> {
        self.adaptors.keys().copied().collect()
    }
}

impl std::fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptorRegistry")
            .field("provider_types", &self.provider_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_provider() {
        let registry = AdaptorRegistry::with_defaults();
        for provider in [
            ProviderType::OpenAI,
            ProviderType::Anthropic,
            ProviderType::Gemini,
        ] {
            assert_eq!(registry.get(provider).unwrap().provider_type(), provider);
        }
    }

    #[test]
    fn test_missing_adaptor_is_an_error() {
        let registry = AdaptorRegistry::empty();
        assert!(matches!(
            registry.get(ProviderType::Gemini),
            Err(AdaptorError::MissingAdaptor(ProviderType::Gemini))
        ));
    }
}

//! Provider manager: named registry with fallback resolution.

use dashmap::DashMap;
use std::sync::Arc;

use super::{LlmProvider, ProviderOp};
use crate::types::ProviderError;

/// Holds the configured providers and resolves one per call site.
///
/// Resolution order in [`ProviderManager::get_with_fallback`]:
/// preferred name → configured default → any registered provider
/// (alphabetical, for determinism).
pub struct ProviderManager {
    providers: DashMap<String, Arc<dyn LlmProvider>>,
    default_name: String,
}

impl ProviderManager {
    pub fn new(default_name: impl Into<String>) -> Self {
        Self {
            providers: DashMap::new(),
            default_name: default_name.into(),
        }
    }

    pub fn register(&self, provider: Arc<dyn LlmProvider>) {
        let name = provider.name().to_string();
        tracing::info!(provider = %name, "registered LLM provider");
        self.providers.insert(name, provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(name).map(|p| p.value().clone())
    }

    /// First available provider, preferring `preferred`, then the
    /// configured default.
    pub fn get_with_fallback(
        &self,
        preferred: Option<&str>,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        if let Some(name) = preferred {
            if let Some(provider) = self.get(name) {
                return Ok(provider);
            }
        }
        if let Some(provider) = self.get(&self.default_name) {
            return Ok(provider);
        }

        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
            .first()
            .and_then(|name| self.get(name))
            .ok_or_else(|| ProviderError::NoProviderAvailable {
                preferred: preferred.map(String::from),
            })
    }

    /// Default chat provider.
    pub fn default_provider(&self) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        self.get_with_fallback(None)
    }

    /// First registered provider that supports embedding.
    pub fn embedder(&self) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        if let Some(provider) = self.get(&self.default_name) {
            if provider.supports(ProviderOp::Embed) {
                return Ok(provider);
            }
        }
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        for name in names {
            if let Some(provider) = self.get(&name) {
                if provider.supports(ProviderOp::Embed) {
                    return Ok(provider);
                }
            }
        }
        Err(ProviderError::NoProviderAvailable {
            preferred: Some("embedding-capable".to_string()),
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;

    #[test]
    fn fallback_prefers_explicit_then_default() {
        let manager = ProviderManager::new("mock");
        manager.register(Arc::new(MockProvider::new(8)));

        let preferred = manager.get_with_fallback(Some("anthropic"));
        assert_eq!(preferred.unwrap().name(), "mock");

        let direct = manager.get_with_fallback(Some("mock"));
        assert_eq!(direct.unwrap().name(), "mock");
    }

    #[test]
    fn empty_manager_errors() {
        let manager = ProviderManager::new("anthropic");
        assert!(matches!(
            manager.get_with_fallback(None),
            Err(ProviderError::NoProviderAvailable { .. })
        ));
    }

    #[test]
    fn embedder_requires_embed_support() {
        let manager = ProviderManager::new("mock");
        manager.register(Arc::new(MockProvider::new(8)));
        let embedder = manager.embedder().unwrap();
        assert_eq!(embedder.embedding_dimension(), Some(8));
    }
}

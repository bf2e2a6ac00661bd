//! Provider abstraction: the adapter interface for LLM completion backends.
//!
//! Mirrors the shape of the coding-agent `Harness` trait this codebase also
//! carries, but for single-shot/streaming text completion rather than an
//! interactive subprocess.

mod http;
mod stub;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

pub use http::HttpProvider;
pub use stub::StubProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("permanent provider error: {0}")]
    Permanent(#[source] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<CompletionMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CompletionMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A provider adapter. Object-safe so it can be stored as `Box<dyn Provider>`
/// in a [`ProviderRegistry`].
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Stream completion chunks as they arrive. Implementations without
    /// native streaming support may return a single-item stream carrying the
    /// full response.
    fn stream(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

    fn count_tokens(&self, text: &str) -> u32;

    fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Provider) {}
};

/// Named registry of provider adapters, keyed by `llm.provider`.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, provider: Arc<dyn Provider>) {
        self.providers
            .write()
            .expect("provider registry lock poisoned")
            .insert(provider.name().to_owned(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .read()
            .expect("provider registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.providers
            .read()
            .expect("provider registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_registers_and_retrieves() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(StubProvider::new("stub")));
        assert!(registry.get("stub").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.list(), vec!["stub".to_owned()]);
    }
}

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::{CompletionRequest, CompletionResponse, Provider, ProviderError};

/// Configuration for an HTTP-backed provider adapter.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Skeleton for a real HTTP-backed provider.
///
/// Replacing the LLM itself is out of scope here: this holds the
/// configuration shape a live implementation would need (base URL,
/// credentials) and satisfies the [`Provider`] contract, but `complete` and
/// `stream` return [`ProviderError::Permanent`] rather than making a network
/// call. A deployment that needs a real backend swaps this out for an
/// adapter wired to that provider's SDK.
pub struct HttpProvider {
    config: HttpProviderConfig,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        Err(ProviderError::Permanent(anyhow::anyhow!(
            "HttpProvider({}) has no transport wired to {}",
            self.config.name,
            self.config.base_url
        )))
    }

    fn stream(
        &self,
        _request: CompletionRequest,
    ) -> Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>> {
        let name = self.config.name.clone();
        let base_url = self.config.base_url.clone();
        Box::pin(futures::stream::once(async move {
            Err(ProviderError::Permanent(anyhow::anyhow!(
                "HttpProvider({name}) has no transport wired to {base_url}"
            )))
        }))
    }

    fn count_tokens(&self, text: &str) -> u32 {
        // Rough heuristic pending a real tokenizer; good enough for cost
        // estimation but not for exact context-window accounting.
        (text.len() / 4).max(1) as u32
    }

    fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens + output_tokens) as f64 * 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_returns_permanent_without_transport() {
        let provider = HttpProvider::new(HttpProviderConfig {
            name: "openai".to_owned(),
            base_url: "https://api.openai.com".to_owned(),
            api_key: None,
        });
        let err = provider
            .complete(CompletionRequest {
                model: "gpt-4".to_owned(),
                system_prompt: String::new(),
                messages: vec![],
                temperature: None,
                max_tokens: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
    }
}

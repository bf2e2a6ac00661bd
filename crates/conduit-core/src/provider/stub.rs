use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::{CompletionRequest, CompletionResponse, Provider, ProviderError};

/// A deterministic provider used by tests and local development: echoes the
/// last user message back as the completion, with a token count derived from
/// a simple whitespace split rather than a real tokenizer.
pub struct StubProvider {
    name: String,
}

impl StubProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let content = request
            .messages
            .last()
            .map(|m| format!("echo: {}", m.content))
            .unwrap_or_default();
        let input_tokens = request.messages.iter().map(|m| self.count_tokens(&m.content)).sum();
        let output_tokens = self.count_tokens(&content);
        Ok(CompletionResponse {
            content,
            input_tokens,
            output_tokens,
        })
    }

    fn stream(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>> {
        let content = request
            .messages
            .last()
            .map(|m| format!("echo: {}", m.content))
            .unwrap_or_default();
        Box::pin(futures::stream::once(async move { Ok(content) }))
    }

    fn count_tokens(&self, text: &str) -> u32 {
        text.split_whitespace().count() as u32
    }

    fn estimate_cost(&self, _input_tokens: u32, _output_tokens: u32) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_last_message() {
        let provider = StubProvider::new("stub");
        let response = provider
            .complete(CompletionRequest {
                model: "stub-model".to_owned(),
                system_prompt: String::new(),
                messages: vec![super::super::CompletionMessage {
                    role: "user".to_owned(),
                    content: "hello there".to_owned(),
                }],
                temperature: None,
                max_tokens: None,
            })
            .await
            .unwrap();
        assert_eq!(response.content, "echo: hello there");
        assert_eq!(response.output_tokens, 3);
    }
}

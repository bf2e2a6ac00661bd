use std::collections::HashMap;

/// Provider credential lookup, populated from environment variables.
///
/// A descriptor never carries credentials on disk; the registry injects them
/// at load time keyed by the descriptor's `llm.provider` field, following the
/// fixed secret injection table: `openai`/`anthropic` get a single `api_key`;
/// `bedrock` gets `region`/`access_key_id`/`secret_access_key` from the usual
/// AWS environment variables; `ollama` gets `base_url`, defaulted to
/// `http://localhost:11434` when unset rather than left empty.
#[derive(Debug, Clone, Default)]
pub struct SecretTable {
    by_provider: HashMap<String, HashMap<String, String>>,
}

const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

impl SecretTable {
    pub fn from_env() -> Self {
        let mut by_provider = HashMap::new();

        let mut openai = HashMap::new();
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            openai.insert("api_key".to_owned(), key);
        }
        if !openai.is_empty() {
            by_provider.insert("openai".to_owned(), openai);
        }

        let mut anthropic = HashMap::new();
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            anthropic.insert("api_key".to_owned(), key);
        }
        if !anthropic.is_empty() {
            by_provider.insert("anthropic".to_owned(), anthropic);
        }

        let mut bedrock = HashMap::new();
        if let Ok(region) = std::env::var("AWS_REGION") {
            bedrock.insert("region".to_owned(), region);
        }
        if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
            bedrock.insert("access_key_id".to_owned(), key);
        }
        if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
            bedrock.insert("secret_access_key".to_owned(), secret);
        }
        if !bedrock.is_empty() {
            by_provider.insert("bedrock".to_owned(), bedrock);
        }

        // ollama always resolves to a usable base_url, defaulted rather than
        // left absent, since a local Ollama install needs no credential.
        let mut ollama = HashMap::new();
        ollama.insert(
            "base_url".to_owned(),
            std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| DEFAULT_OLLAMA_BASE_URL.to_owned()),
        );
        by_provider.insert("ollama".to_owned(), ollama);

        Self { by_provider }
    }

    pub fn for_provider(&self, provider: &str) -> HashMap<String, String> {
        self.by_provider.get(provider).cloned().unwrap_or_default()
    }

    /// Whether `provider` has any usable credential available. `ollama`
    /// always does (it defaults its `base_url`); others require at least one
    /// injected key.
    pub fn has_credentials(&self, provider: &str) -> bool {
        provider == "ollama" || self.by_provider.get(provider).is_some_and(|m| !m.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_returns_empty_credentials() {
        let table = SecretTable::default();
        assert!(table.for_provider("some-unconfigured-provider").is_empty());
    }
}

//! Completion providers
//!
//! The kernel talks to language models through one narrow trait. The
//! syscall path calls it from inside a running script, so the trait is
//! synchronous; providers that need I/O are expected to block with
//! their own timeout. The deterministic provider needs neither network
//! nor keys and is the default in tests and offline runs.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("provider not available: {0}")]
    ProviderNotAvailable(String),
}

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
        }
    }

    /// Rough prompt size: four characters per token, floored at 20.
    pub fn estimate_tokens(&self) -> u64 {
        let chars: usize = self.messages.iter().map(|m| m.content.len()).sum();
        (chars as u64 / 4).max(20)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Marginal cost in budget units.
    #[serde(default)]
    pub cost: f64,
    /// True when the provider answered from cache; cached answers are
    /// free and do not count against the call rate limit.
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A model backend.
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Stable stand-in provider: no network, no keys, zero cost.
///
/// Responses are derived from a hash of the request so repeated runs
/// are reproducible; an exact repeat is reported as a cache hit.
#[derive(Default)]
pub struct DeterministicProvider {
    seen: Mutex<HashSet<u64>>,
}

impl DeterministicProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn fingerprint(request: &CompletionRequest) -> u64 {
        let mut hasher = DefaultHasher::new();
        request.model.hash(&mut hasher);
        for message in &request.messages {
            message.content.hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl CompletionProvider for DeterministicProvider {
    fn name(&self) -> &'static str {
        "deterministic"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let fingerprint = Self::fingerprint(request);
        let cache_hit = match self.seen.lock() {
            Ok(mut seen) => !seen.insert(fingerprint),
            Err(_) => false,
        };
        let prompt_tokens = request.estimate_tokens();
        let content = format!(
            "{{\"note\": \"deterministic response {fingerprint:016x}\"}}"
        );
        let completion_tokens = (content.len() as u64 / 4).max(1);
        Ok(CompletionResponse {
            content,
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: if cache_hit {
                    0
                } else {
                    prompt_tokens + completion_tokens
                },
            },
            cost: 0.0,
            cache_hit,
            model: Some("deterministic".to_string()),
        })
    }
}

/// Provider that always fails, for exercising refund paths in tests.
pub struct FailingProvider;

impl CompletionProvider for FailingProvider {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Err(LlmError::RequestFailed("provider offline".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_responses_are_stable_and_cached() {
        let provider = DeterministicProvider::new();
        let request = CompletionRequest::new("any", vec![Message::user("hello world")]);

        let first = provider.complete(&request).unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.cost, 0.0);

        let second = provider.complete(&request).unwrap();
        assert!(second.cache_hit);
        assert_eq!(first.content, second.content);
        assert_eq!(second.usage.total_tokens, 0);
    }

    #[test]
    fn token_estimate_has_a_floor() {
        let request = CompletionRequest::new("any", vec![Message::user("hi")]);
        assert_eq!(request.estimate_tokens(), 20);

        let long = CompletionRequest::new("any", vec![Message::user("x".repeat(400))]);
        assert_eq!(long.estimate_tokens(), 100);
    }
}

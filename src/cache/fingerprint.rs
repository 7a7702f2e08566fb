//! Prompt fingerprinting
//!
//! A prompt key is a SHA-256 digest over the canonical form of a request:
//! provider, model, the sampling parameters that influence output, and the
//! normalized message list as ordered (role, content) pairs. Two requests
//! with the same fingerprint are interchangeable for caching purposes.

use sha2::{Digest, Sha256};

use crate::types::{ChatMessage, CompletionRequest};

/// Provider component used in the fingerprint when the caller pins no
/// provider, so unpinned requests dedupe against each other.
pub const ANY_PROVIDER: &str = "any";

/// Normalize prompt text: trim, collapse whitespace runs (which also folds
/// line endings), lowercase. Idempotent.
pub fn normalize_text(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Normalized prompt text of a message list, retained on cache entries for
/// similarity search
pub fn normalize_messages(messages: &[ChatMessage]) -> String {
    normalize_text(
        &messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" "),
    )
}

/// Canonical fingerprint of a request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PromptKey(String);

impl PromptKey {
    /// Fingerprint from the raw parts
    pub fn compute(
        provider: &str,
        model: &str,
        messages: &[ChatMessage],
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_bytes());
        hasher.update(b"\n");
        hasher.update(model.as_bytes());
        hasher.update(b"\n");
        match temperature {
            Some(t) => hasher.update(format!("temp={t}\n")),
            None => hasher.update("temp=default\n"),
        }
        match max_tokens {
            Some(n) => hasher.update(format!("max={n}\n")),
            None => hasher.update("max=default\n"),
        }
        for message in messages {
            hasher.update(format!("{}:{}\n", message.role, normalize_text(&message.content)));
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Fingerprint for a completion request, with `provider` being the
    /// caller's explicit provider or [`ANY_PROVIDER`]
    pub fn for_request(provider: Option<&str>, request: &CompletionRequest) -> Self {
        Self::compute(
            provider.unwrap_or(ANY_PROVIDER),
            &request.model,
            &request.messages,
            request.temperature,
            request.max_tokens,
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PromptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

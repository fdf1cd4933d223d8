//! Domain service for producing attribute values with generative models.
//!
//! This module provides the [`Generator`] trait together with the request
//! and result types shared by every backend.

use crate::domain::{GenerationKind, ResolvedTraits, SafetyTier};
use std::time::Duration;
use thiserror::Error;

/// Domain errors for generation requests.
#[derive(Debug, Error)]
pub enum GenError {
    #[error("Generator rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Request rejected by content policy: {0}")]
    PolicyRejected(String),

    #[error("Generation timed out: {0}")]
    Timeout(String),

    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl GenError {
    /// Short label used in metrics and summaries.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::PolicyRejected(_) => "policy_rejected",
            Self::Timeout(_) => "timeout",
            Self::Upstream(_) => "upstream",
        }
    }
}

/// Everything a backend needs to produce one attribute value.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub subject_name: String,
    pub subject: ResolvedTraits,
    /// Image prompt, or the user message for text generation.
    pub prompt: String,
    /// System instructions for text generation.
    pub instructions: Option<String>,
    pub negative_prompt: Option<String>,
    pub safety: SafetyTier,
}

/// Result of a successful generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Short-lived URL hosted by the provider.
    RemoteUrl(String),
    Text(String),
}

/// Domain service trait for generative backends.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    /// Generates one artifact.
    ///
    /// Implementations never substitute placeholder output; a request either
    /// yields a real artifact or an error.
    ///
    /// # Errors
    ///
    /// - Returns [`GenError::RateLimited`] when the provider throttles, with its
    ///   retry hint if it sent one
    /// - Returns [`GenError::PolicyRejected`] when the provider refuses the prompt
    /// - Returns [`GenError::Timeout`] when no result arrived in time
    async fn generate(
        &self,
        kind: GenerationKind,
        params: &GenerationParams,
    ) -> Result<Artifact, GenError>;
}

/// True when `message` carries one of the lowercase policy `markers`.
#[must_use]
pub fn mentions_policy(message: &str, markers: &[String]) -> bool {
    let message = message.to_lowercase();
    markers
        .iter()
        .any(|m| !m.is_empty() && message.contains(m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_markers() {
        let markers = vec!["nsfw".to_string(), "content policy".to_string()];
        assert!(mentions_policy("NSFW content detected", &markers));
        assert!(mentions_policy("Violates Content Policy", &markers));
        assert!(!mentions_policy("CUDA out of memory", &markers));
    }
}

//! Generation Client
//!
//! A single-shot call to an external text-generation service: prompt in,
//! completion text out, with token and latency metrics. There is no logic here
//! beyond timeout enforcement and rejecting empty completions.
//!
//! Clients are shared behind `Arc` and must be safe for concurrent use. Tests
//! substitute scripted fakes through the [`GenerationClient`] trait.

pub mod ollama;

use std::future::Future;
use std::time::Duration;

use crate::error::{AskError, Result};

pub use ollama::{OllamaClient, OllamaOptions};

/// One generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Stop sequences
    pub stop: Vec<String>,
    /// Completion token budget; `None` uses the client default
    pub max_tokens: Option<u32>,
    /// Wall-clock bound for the whole call
    pub timeout: Duration,
}

impl GenerationRequest {
    #[must_use]
    pub fn new(prompt: impl Into<String>, timeout: Duration) -> Self {
        Self { prompt: prompt.into(), stop: Vec::new(), max_tokens: None, timeout }
    }

    #[must_use]
    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }

    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Completion text and call metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    /// Model identifier reported by the service
    pub model: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub duration: Duration,
}

/// Text-generation service
pub trait GenerationClient: Send + Sync {
    /// Issue one generation call
    ///
    /// Implementations should honor `request.timeout`; callers additionally
    /// bound the call with [`generate_within`].
    fn generate(
        &self,
        request: &GenerationRequest,
    ) -> impl Future<Output = Result<Completion>> + Send;

    /// Configured model identifier
    fn model(&self) -> &str;
}

/// Call `client` bounded by `request.timeout`
///
/// Elapsing maps to [`AskError::GenerationTimeout`]; the in-flight call is
/// dropped. A blank completion is a [`AskError::GenerationFailed`].
pub async fn generate_within<G: GenerationClient>(
    client: &G,
    request: &GenerationRequest,
) -> Result<Completion> {
    let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);

    let completion = tokio::time::timeout(request.timeout, client.generate(request))
        .await
        .map_err(|_| AskError::GenerationTimeout { timeout_ms })??;

    if completion.text.trim().is_empty() {
        return Err(AskError::generation_failed("empty completion"));
    }

    tracing::debug!(
        model = completion.model.as_deref().unwrap_or(client.model()),
        prompt_tokens = completion.prompt_tokens,
        completion_tokens = completion.completion_tokens,
        duration_ms = u64::try_from(completion.duration.as_millis()).unwrap_or(u64::MAX),
        "generation call finished"
    );

    Ok(completion)
}

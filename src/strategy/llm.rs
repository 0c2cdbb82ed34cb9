//! LLM SQL strategy: one constrained generation call per question

use std::sync::Arc;
use std::time::Duration;

use super::extract::extract_sql;
use super::prompt::{sql_prompt, PromptContext, SQL_CLOSE};
use super::{CandidateSql, Generated, Provenance};
use crate::assemble::Metrics;
use crate::error::{AskError, Result};
use crate::generation::{generate_within, GenerationClient, GenerationRequest};
use crate::guard::SafetyGuard;

/// Prompt, generate, extract, vet
///
/// Generation errors are returned as they are; the caller decides whether to
/// retry or fall back. A guard rejection is `UnsafeGeneration` and is never
/// retried.
#[derive(Debug)]
pub struct LlmStrategy<G> {
    client: Arc<G>,
    guard: SafetyGuard,
    timeout: Duration,
    max_tokens: Option<u32>,
}

impl<G> Clone for LlmStrategy<G> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            guard: self.guard.clone(),
            timeout: self.timeout,
            max_tokens: self.max_tokens,
        }
    }
}

impl<G: GenerationClient> LlmStrategy<G> {
    #[must_use]
    pub const fn new(client: Arc<G>, guard: SafetyGuard, timeout: Duration) -> Self {
        Self { client, guard, timeout, max_tokens: None }
    }

    /// Completion budget; `None` uses the client default
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Produce a vetted statement for `question`
    pub async fn generate(&self, question: &str, ctx: &PromptContext) -> Result<Generated> {
        let prompt = sql_prompt(question, ctx);
        tracing::debug!(%prompt, "llm strategy prompt");

        let mut request = GenerationRequest::new(prompt, self.timeout).with_stop(SQL_CLOSE);
        request.max_tokens = self.max_tokens;

        let completion = generate_within(self.client.as_ref(), &request).await?;
        let metrics = Metrics::from_completion(&completion);
        let model = completion.model.clone().or_else(|| Some(self.client.model().to_string()));

        let sql = extract_sql(&completion.text, self.guard.dialect())?;
        let vetted = self.guard.evaluate(&sql).into_result().map_err(|reason| {
            tracing::warn!(code = reason.code(), "guard rejected generated statement");
            AskError::UnsafeGeneration(reason)
        })?;

        Ok(Generated { candidate: CandidateSql::new(vetted, Provenance::Llm), metrics, model })
    }
}

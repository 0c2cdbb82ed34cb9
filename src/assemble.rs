//! Response Assembler
//!
//! Merges the final SQL, the execution result and the generation metrics into
//! the one payload shape every route returns. Purely a data-merging step: the
//! SQL is never touched here and nothing in this module can fail.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::agent::AgentPlan;
use crate::engine::ExecutionResult;
use crate::generation::Completion;
use crate::i18n::{render_summary, Language};

/// User-facing logical route of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Pattern,
    Llm,
    Agent,
    Raw,
    Preset,
}

impl Route {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Llm => "llm",
            Self::Agent => "agent",
            Self::Raw => "raw",
            Self::Preset => "preset",
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token and latency totals across the generation calls behind a payload
///
/// All zero when the route made no generation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Sum of the calls' durations
    pub generation_ms: u64,
}

impl Metrics {
    #[must_use]
    pub fn from_completion(completion: &Completion) -> Self {
        let mut metrics = Self::default();
        metrics.record(completion);
        metrics
    }

    /// Add one call
    pub fn record(&mut self, completion: &Completion) {
        self.merge(&Self {
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
            total_tokens: completion.prompt_tokens.saturating_add(completion.completion_tokens),
            generation_ms: u64::try_from(completion.duration.as_millis()).unwrap_or(u64::MAX),
        });
    }

    /// Additive merge
    pub fn merge(&mut self, other: &Self) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        self.generation_ms = self.generation_ms.saturating_add(other.generation_ms);
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// The only entity ever returned to a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub route: Route,
    /// Final statement as executed
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    /// Localized one-line description of the result shape
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<AgentPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub metrics: Metrics,
    pub via_fallback: bool,
    /// Wall clock from request start to payload construction
    pub total_ms: u64,
}

impl ResponsePayload {
    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    #[must_use]
    pub fn with_preset(mut self, name: impl Into<String>) -> Self {
        self.preset_name = Some(name.into());
        self
    }

    #[must_use]
    pub const fn with_fallback(mut self, via_fallback: bool) -> Self {
        self.via_fallback = via_fallback;
        self
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Per-request assembler; the clock starts at construction
#[derive(Debug, Clone, Copy)]
pub struct ResponseAssembler {
    language: Language,
    started: Instant,
}

impl ResponseAssembler {
    #[must_use]
    pub fn start(language: Language) -> Self {
        Self { language, started: Instant::now() }
    }

    #[must_use]
    pub const fn language(&self) -> Language {
        self.language
    }

    /// Build the payload; an absent result renders as zero rows and no columns
    #[must_use]
    pub fn assemble(
        &self,
        route: Route,
        sql: String,
        result: Option<ExecutionResult>,
        metrics: Metrics,
        plan: Option<AgentPlan>,
    ) -> ResponsePayload {
        let ExecutionResult { columns, rows } = result.unwrap_or_default();
        let summary = render_summary(self.language, rows.len(), &columns);

        ResponsePayload {
            route,
            sql,
            columns,
            rows,
            summary,
            plan,
            preset_name: None,
            model: None,
            metrics,
            via_fallback: false,
            total_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

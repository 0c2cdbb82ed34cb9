//! Generation Strategies
//!
//! A request names exactly one [`Strategy`]. Each variant turns its input into
//! a [`CandidateSql`] that the guard vets before execution:
//!
//! - `Pattern`: catalog lookup, no generation call
//! - `Llm`: one constrained generation call ([`LlmStrategy`])
//! - `Agent`: plan, draft and self-check with fallback to `Llm`
//! - `Raw`: caller-supplied SQL
//! - `Preset`: named statement from the preset catalog

pub mod extract;
pub mod llm;
pub mod prompt;

use serde::{Deserialize, Serialize};

use crate::assemble::{Metrics, Route};

pub use extract::extract_sql;
pub use llm::LlmStrategy;
pub use prompt::PromptContext;

/// Which strategy produced a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Pattern,
    Llm,
    Agent,
    Raw,
    Preset,
}

/// A statement on its way to the guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSql {
    pub sql: String,
    pub provenance: Provenance,
    /// Template parameters that fell back to their defaults
    pub placeholders: Vec<String>,
}

impl CandidateSql {
    #[must_use]
    pub fn new(sql: impl Into<String>, provenance: Provenance) -> Self {
        Self { sql: sql.into(), provenance, placeholders: Vec::new() }
    }
}

/// A candidate plus what it cost to generate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub candidate: CandidateSql,
    pub metrics: Metrics,
    /// Model reported by the generation service
    pub model: Option<String>,
}

/// How a request asks for its SQL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "input", rename_all = "lowercase")]
pub enum Strategy {
    /// Question answered from the pattern catalog
    Pattern(String),
    /// Question answered by one generation call
    Llm(String),
    /// Question answered by the agent orchestrator
    Agent(String),
    /// Caller-supplied SQL
    Raw(String),
    /// Preset name
    Preset(String),
}

impl Strategy {
    /// Logical route reported in the payload
    #[must_use]
    pub const fn route(&self) -> Route {
        match self {
            Self::Pattern(_) => Route::Pattern,
            Self::Llm(_) => Route::Llm,
            Self::Agent(_) => Route::Agent,
            Self::Raw(_) => Route::Raw,
            Self::Preset(_) => Route::Preset,
        }
    }

    /// The question, statement or preset name
    #[must_use]
    pub fn input(&self) -> &str {
        match self {
            Self::Pattern(s) | Self::Llm(s) | Self::Agent(s) | Self::Raw(s) | Self::Preset(s) => s,
        }
    }
}

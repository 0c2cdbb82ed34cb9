//! Request pipeline
//!
//! One [`QueryService`] serves every route: a strategy produces a candidate,
//! the guard vets it once more, the executor runs it and the assembler builds
//! the payload. Collaborators are passed in at construction; nothing here is
//! global, so tests substitute fakes for the generation service and the
//! database.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;

use crate::agent::{AgentOrchestrator, AgentPlan};
use crate::assemble::{Metrics, ResponseAssembler, ResponsePayload};
use crate::config::AppConfig;
use crate::dialect::SqlDialect;
use crate::engine::{ExecLimits, QueryExecutor, SchemaScope, SchemaSummary};
use crate::error::{AskError, Result};
use crate::generation::GenerationClient;
use crate::guard::{SafetyGuard, SafetyVerdict};
use crate::i18n::Language;
use crate::pattern::PatternMatcher;
use crate::preset::PresetCatalog;
use crate::strategy::{CandidateSql, LlmStrategy, PromptContext, Provenance, Strategy};

/// One caller request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub strategy: Strategy,
    /// Explicit answer language; detected from the question when absent
    pub language: Option<Language>,
}

impl Request {
    #[must_use]
    pub const fn new(strategy: Strategy) -> Self {
        Self { strategy, language: None }
    }

    #[must_use]
    pub const fn with_language(mut self, language: Option<Language>) -> Self {
        self.language = language;
        self
    }

    /// Language of the answer
    ///
    /// Questions are detected from their script. Raw SQL and preset names say
    /// nothing about the caller, so those use the hint or the default.
    #[must_use]
    pub fn language(&self) -> Language {
        match &self.strategy {
            Strategy::Pattern(q) | Strategy::Llm(q) | Strategy::Agent(q) => {
                Language::resolve(self.language, q)
            }
            Strategy::Raw(_) | Strategy::Preset(_) => self.language.unwrap_or_default(),
        }
    }
}

/// Guard-only report for `check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub accepted: bool,
    /// Statement as it would be executed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CheckReport {
    #[must_use]
    pub fn from_verdict(verdict: SafetyVerdict, lang: Language) -> Self {
        match verdict {
            SafetyVerdict::Accepted(sql) => {
                Self { accepted: true, sql: Some(sql), code: None, reason: None }
            }
            SafetyVerdict::Rejected(reason) => Self {
                accepted: false,
                sql: None,
                code: Some(reason.code()),
                reason: Some(reason.describe(lang)),
            },
        }
    }
}

/// What a strategy handed over before execution
struct Answer {
    candidate: CandidateSql,
    metrics: Metrics,
    plan: Option<AgentPlan>,
    model: Option<String>,
    via_fallback: bool,
    preset: Option<String>,
}

impl Answer {
    fn direct(candidate: CandidateSql) -> Self {
        Self {
            candidate,
            metrics: Metrics::default(),
            plan: None,
            model: None,
            via_fallback: false,
            preset: None,
        }
    }
}

/// The pipeline, shared across requests
pub struct QueryService<G, E> {
    executor: Arc<E>,
    guard: SafetyGuard,
    patterns: PatternMatcher,
    presets: PresetCatalog,
    llm: LlmStrategy<G>,
    agent: AgentOrchestrator<G>,
    scope: SchemaScope,
    limits: ExecLimits,
    pattern_fallback: bool,
    summary: OnceCell<SchemaSummary>,
}

impl<G, E> std::fmt::Debug for QueryService<G, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("dialect", &self.guard.dialect())
            .field("presets", &self.presets.len())
            .field("pattern_fallback", &self.pattern_fallback)
            .finish_non_exhaustive()
    }
}

impl<G: GenerationClient, E: QueryExecutor> QueryService<G, E> {
    /// Wire the pipeline from `config`
    ///
    /// The dialect is the configured one, else the executor's. Fails with
    /// `ConfigError` when a preset does not pass the guard.
    pub fn new(config: &AppConfig, client: Arc<G>, executor: Arc<E>) -> Result<Self> {
        let dialect = config.dialect.unwrap_or_else(|| executor.dialect());
        let guard = SafetyGuard::new(config.guard_policy(dialect));
        let schema = config.schema.schema.clone();

        let patterns = PatternMatcher::new(dialect, schema.clone(), config.max_rows);
        let presets = PresetCatalog::load(&guard, schema, config.presets_file.as_deref())?;
        let llm = LlmStrategy::new(Arc::clone(&client), guard.clone(), config.generation.timeout);
        let agent = AgentOrchestrator::new(client, guard.clone(), llm.clone(), config.agent.clone());
        let limits = ExecLimits {
            max_rows: usize::try_from(config.max_rows).unwrap_or(usize::MAX),
            timeout: config.execution_timeout,
        };

        tracing::debug!(%dialect, presets = presets.len(), "query service ready");

        Ok(Self {
            executor,
            guard,
            patterns,
            presets,
            llm,
            agent,
            scope: config.schema.clone(),
            limits,
            pattern_fallback: config.pattern_fallback,
            summary: OnceCell::new(),
        })
    }

    #[must_use]
    pub fn dialect(&self) -> SqlDialect {
        self.guard.dialect()
    }

    /// Answer one request
    pub async fn handle(&self, request: Request) -> Result<ResponsePayload> {
        let assembler = ResponseAssembler::start(request.language());
        let route = request.strategy.route();
        tracing::info!(%route, "handling request");

        let answer = self.produce(&request.strategy).await?;
        let sql = self.vet_before_execution(&answer.candidate)?;
        tracing::debug!(%sql, "executing");

        let cap = usize::try_from(self.guard.row_cap(&sql)).unwrap_or(usize::MAX);
        let limits = ExecLimits { max_rows: cap.min(self.limits.max_rows), ..self.limits };
        let mut result = self.executor.execute(&sql, &limits).await?;
        result.rows.truncate(limits.max_rows);

        let payload = assembler
            .assemble(route, sql, Some(result), answer.metrics, answer.plan)
            .with_model(answer.model)
            .with_fallback(answer.via_fallback);
        Ok(match answer.preset {
            Some(name) => payload.with_preset(name),
            None => payload,
        })
    }

    /// Preset name → description
    #[must_use]
    pub fn list_presets(&self) -> BTreeMap<String, String> {
        self.presets.list()
    }

    /// Run the guard without executing
    #[must_use]
    pub fn check(&self, sql: &str, lang: Language) -> CheckReport {
        CheckReport::from_verdict(self.guard.evaluate(sql), lang)
    }

    /// Schema described to the model, loaded on first use
    ///
    /// A failed description is logged and replaced by the configured table
    /// names, so generation still works without column detail.
    pub async fn schema(&self) -> &SchemaSummary {
        self.summary
            .get_or_init(|| async {
                match self.executor.describe_schema(&self.scope).await {
                    Ok(summary) => summary,
                    Err(e) => {
                        tracing::warn!(error = %e, "schema description failed; using table names only");
                        SchemaSummary::from_names(self.scope.tables.iter().cloned())
                    }
                }
            })
            .await
    }

    async fn prompt_context(&self) -> PromptContext {
        PromptContext::new(self.dialect(), self.scope.schema.clone(), self.schema().await.clone())
    }

    async fn produce(&self, strategy: &Strategy) -> Result<Answer> {
        match strategy {
            Strategy::Pattern(question) => self.pattern(require_question(question)?).await,
            Strategy::Llm(question) => {
                let ctx = self.prompt_context().await;
                let generated = self.llm.generate(require_question(question)?, &ctx).await?;
                Ok(Answer {
                    metrics: generated.metrics,
                    model: generated.model,
                    ..Answer::direct(generated.candidate)
                })
            }
            Strategy::Agent(question) => {
                let ctx = self.prompt_context().await;
                let outcome = self.agent.run(require_question(question)?, &ctx).await?;
                if let Some(reason) = &outcome.fallback_reason {
                    tracing::warn!(%reason, "agent answered through the fallback strategy");
                }
                Ok(Answer {
                    metrics: outcome.metrics,
                    plan: outcome.plan,
                    model: outcome.model,
                    via_fallback: outcome.via_fallback,
                    ..Answer::direct(outcome.candidate)
                })
            }
            Strategy::Raw(sql) => {
                let vetted = self.vet_manual(sql)?;
                Ok(Answer::direct(CandidateSql::new(vetted, Provenance::Raw)))
            }
            Strategy::Preset(name) => {
                let preset = self.presets.get(name.trim())?;
                let vetted = self.vet_manual(&preset.sql)?;
                Ok(Answer {
                    preset: Some(preset.name.clone()),
                    ..Answer::direct(CandidateSql::new(vetted, Provenance::Preset))
                })
            }
        }
    }

    async fn pattern(&self, question: &str) -> Result<Answer> {
        if let Some(found) = self.patterns.match_question(question) {
            tracing::info!(rule = found.rule, "pattern matched");
            return Ok(Answer::direct(found.candidate));
        }
        if !self.pattern_fallback {
            return Err(AskError::NoPatternMatch);
        }

        tracing::warn!("no pattern matched; answering with the llm strategy");
        let ctx = self.prompt_context().await;
        let generated = self.llm.generate(question, &ctx).await?;
        Ok(Answer {
            metrics: generated.metrics,
            model: generated.model,
            via_fallback: true,
            ..Answer::direct(generated.candidate)
        })
    }

    fn vet_manual(&self, sql: &str) -> Result<String> {
        self.guard.evaluate(sql).into_result().map_err(|reason| {
            tracing::warn!(code = reason.code(), "guard rejected manual statement");
            AskError::ManualSqlRejected(reason)
        })
    }

    /// Last guard pass; accepted statements come back unchanged
    fn vet_before_execution(&self, candidate: &CandidateSql) -> Result<String> {
        self.guard.evaluate(&candidate.sql).into_result().map_err(|reason| {
            tracing::warn!(code = reason.code(), provenance = ?candidate.provenance, "guard rejected candidate before execution");
            match candidate.provenance {
                Provenance::Raw | Provenance::Preset => AskError::ManualSqlRejected(reason),
                Provenance::Pattern | Provenance::Llm | Provenance::Agent => {
                    AskError::UnsafeGeneration(reason)
                }
            }
        })
    }
}

fn require_question(question: &str) -> Result<&str> {
    let question = question.trim();
    if question.is_empty() {
        return Err(AskError::invalid_input("Question is empty"));
    }
    Ok(question)
}

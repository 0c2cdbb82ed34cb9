//! Agent Orchestrator
//!
//! A small state machine that plans, drafts and self-checks a statement with
//! one generation call per phase:
//!
//! ```text
//! Planning -> Drafting -> SelfChecking -> Done
//!                 ^             |
//!                 +-- redraft --+          (at most once)
//!
//! any phase -> Fallback -> LLM strategy
//! ```
//!
//! A wall-clock budget covers every phase. Each call is bounded by the smaller
//! of the per-call timeout and what is left of the budget, so an exhausted
//! budget surfaces as a timed-out call and the in-flight generation is dropped.
//! Generation failures, timeouts, empty plans and a second negative verdict all
//! lead to `Fallback`. A guard rejection of a draft is a hard stop.

pub mod check;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::assemble::Metrics;
use crate::error::{AskError, Result};
use crate::generation::{generate_within, GenerationClient, GenerationRequest};
use crate::guard::SafetyGuard;
use crate::strategy::extract::extract_sql;
use crate::strategy::prompt::{planner_prompt, verify_prompt, writer_prompt, PromptContext, Redraft, SQL_CLOSE};
use crate::strategy::{CandidateSql, LlmStrategy, Provenance};
use check::{schema_issues, Verdict};

/// Plans longer than this are cut
const MAX_PLAN_STEPS: usize = 12;

/// Token budget of the planning and verification calls
const SHORT_CALL_TOKENS: u32 = 160;

/// Agent timing and self-check settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Upper bound for any single generation call
    #[serde(with = "crate::config::duration")]
    pub call_timeout: Duration,
    /// Wall-clock budget across all phases
    #[serde(with = "crate::config::duration")]
    pub budget: Duration,
    /// Ask the model to verify a draft that passed the local schema check
    pub self_check_with_model: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(8),
            budget: Duration::from_secs(14),
            self_check_with_model: true,
        }
    }
}

/// Advisory steps produced by the planning phase; never executed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPlan {
    pub steps: Vec<String>,
}

impl AgentPlan {
    /// Bullet (`-`, `*`, `•`) and numbered (`1.`, `2)`) lines of `text`
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let steps = text
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                let rest = line
                    .strip_prefix(['-', '*', '•'])
                    .or_else(|| {
                        let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
                        (digits > 0).then(|| &line[digits..]).and_then(|r| r.strip_prefix(['.', ')']))
                    })?
                    .trim();
                (!rest.is_empty()).then(|| rest.trim_matches('*').trim().to_string())
            })
            .filter(|step| !step.is_empty())
            .take(MAX_PLAN_STEPS)
            .collect();
        Self { steps }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Why the orchestrator handed over to the LLM strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// No budget left before a phase started
    BudgetExhausted,
    /// The planning call produced no steps
    EmptyPlan,
    /// A call failed, timed out or produced no statement
    Generation(&'static str),
    /// The redraft was rejected as well
    Rejected(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BudgetExhausted => f.write_str("agent budget exhausted"),
            Self::EmptyPlan => f.write_str("empty plan"),
            Self::Generation(code) => write!(f, "generation error {code}"),
            Self::Rejected(feedback) => write!(f, "redraft rejected: {feedback}"),
        }
    }
}

/// Orchestrator states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Planning,
    Drafting { plan: AgentPlan, redraft: Option<(String, String)> },
    SelfChecking { plan: AgentPlan, draft: String, redrafted: bool },
    Done { plan: AgentPlan, sql: String },
    Fallback { reason: FallbackReason },
}

/// Result of an agent run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutcome {
    pub candidate: CandidateSql,
    /// Present unless the outcome came from the fallback
    pub plan: Option<AgentPlan>,
    /// Every call of the agent path, or only the fallback call
    pub metrics: Metrics,
    pub model: Option<String>,
    pub via_fallback: bool,
    /// For logs only
    pub fallback_reason: Option<FallbackReason>,
}

/// Plan, draft, self-check; fall back to the LLM strategy
#[derive(Debug)]
pub struct AgentOrchestrator<G> {
    client: Arc<G>,
    guard: SafetyGuard,
    fallback: LlmStrategy<G>,
    config: AgentConfig,
    max_tokens: Option<u32>,
}

/// Per-run bookkeeping
struct Run<'a> {
    question: &'a str,
    ctx: &'a PromptContext,
    deadline: Instant,
    metrics: Metrics,
    model: Option<String>,
}

impl<G: GenerationClient> AgentOrchestrator<G> {
    #[must_use]
    pub fn new(client: Arc<G>, guard: SafetyGuard, fallback: LlmStrategy<G>, config: AgentConfig) -> Self {
        Self { client, guard, fallback, config, max_tokens: None }
    }

    /// Token budget of drafting calls
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Answer `question`, falling back to a single LLM call when the agent path fails
    ///
    /// Only `UnsafeGeneration` from a draft, and any error of the fallback
    /// call itself, are returned as errors.
    pub async fn run(&self, question: &str, ctx: &PromptContext) -> Result<AgentOutcome> {
        let mut run = Run {
            question,
            ctx,
            deadline: Instant::now() + self.config.budget,
            metrics: Metrics::default(),
            model: None,
        };

        let mut state = AgentState::Planning;
        loop {
            tracing::debug!(state = state_name(&state), "agent step");
            state = match state {
                AgentState::Planning => self.plan(&mut run).await,
                AgentState::Drafting { plan, redraft } => self.draft(&mut run, plan, redraft).await?,
                AgentState::SelfChecking { plan, draft, redrafted } => {
                    self.self_check(&mut run, plan, draft, redrafted).await
                }
                AgentState::Done { plan, sql } => {
                    tracing::info!(steps = plan.steps.len(), "agent finished");
                    return Ok(AgentOutcome {
                        candidate: CandidateSql::new(sql, Provenance::Agent),
                        plan: Some(plan),
                        metrics: run.metrics,
                        model: run.model,
                        via_fallback: false,
                        fallback_reason: None,
                    });
                }
                AgentState::Fallback { reason } => return self.fall_back(question, ctx, reason).await,
            };
        }
    }

    async fn plan(&self, run: &mut Run<'_>) -> AgentState {
        let prompt = planner_prompt(run.question, run.ctx);
        let text = match self.call(run, prompt, None, Some(SHORT_CALL_TOKENS)).await {
            Ok(text) => text,
            Err(reason) => return AgentState::Fallback { reason },
        };

        let plan = AgentPlan::parse(&text);
        if plan.is_empty() {
            return AgentState::Fallback { reason: FallbackReason::EmptyPlan };
        }
        AgentState::Drafting { plan, redraft: None }
    }

    async fn draft(
        &self,
        run: &mut Run<'_>,
        plan: AgentPlan,
        redraft: Option<(String, String)>,
    ) -> Result<AgentState> {
        let feedback = redraft
            .as_ref()
            .map(|(previous_sql, feedback)| Redraft { previous_sql: previous_sql.as_str(), feedback: feedback.as_str() });
        let prompt = writer_prompt(run.question, &plan.steps, feedback.as_ref(), run.ctx);

        let text = match self.call(run, prompt, Some(SQL_CLOSE), self.max_tokens).await {
            Ok(text) => text,
            Err(reason) => return Ok(AgentState::Fallback { reason }),
        };
        let sql = match extract_sql(&text, self.guard.dialect()) {
            Ok(sql) => sql,
            Err(e) => return Ok(AgentState::Fallback { reason: FallbackReason::Generation(e.error_code()) }),
        };

        let draft = self.guard.evaluate(&sql).into_result().map_err(|reason| {
            tracing::warn!(code = reason.code(), "guard rejected agent draft");
            AskError::UnsafeGeneration(reason)
        })?;

        Ok(AgentState::SelfChecking { plan, draft, redrafted: redraft.is_some() })
    }

    async fn self_check(&self, run: &mut Run<'_>, plan: AgentPlan, draft: String, redrafted: bool) -> AgentState {
        let issues = schema_issues(&draft, &run.ctx.summary, run.ctx.dialect);
        let feedback = if !issues.is_empty() {
            Some(issues.join("; "))
        } else if self.config.self_check_with_model {
            let prompt = verify_prompt(run.question, &draft, run.ctx);
            match self.call(run, prompt, None, Some(SHORT_CALL_TOKENS)).await {
                Ok(text) => match Verdict::parse(&text) {
                    Verdict::Ok => None,
                    Verdict::Fix(reason) => Some(reason),
                    Verdict::Malformed => Some("the verification answer had no VERDICT line".to_string()),
                },
                Err(reason) => return AgentState::Fallback { reason },
            }
        } else {
            None
        };

        match feedback {
            None => AgentState::Done { plan, sql: draft },
            Some(feedback) if redrafted => AgentState::Fallback { reason: FallbackReason::Rejected(feedback) },
            Some(feedback) => {
                tracing::info!(%feedback, "agent redrafting");
                AgentState::Drafting { plan, redraft: Some((draft, feedback)) }
            }
        }
    }

    /// One budgeted generation call; failures become fallback reasons
    async fn call(
        &self,
        run: &mut Run<'_>,
        prompt: String,
        stop: Option<&str>,
        max_tokens: Option<u32>,
    ) -> std::result::Result<String, FallbackReason> {
        let remaining = run.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(FallbackReason::BudgetExhausted);
        }

        let mut request = GenerationRequest::new(prompt, self.config.call_timeout.min(remaining));
        request.max_tokens = max_tokens;
        if let Some(stop) = stop {
            request = request.with_stop(stop);
        }

        match generate_within(self.client.as_ref(), &request).await {
            Ok(completion) => {
                run.metrics.record(&completion);
                run.model = completion.model.or_else(|| Some(self.client.model().to_string()));
                Ok(completion.text)
            }
            Err(e) => {
                tracing::debug!(error = %e, "agent call failed");
                Err(FallbackReason::Generation(e.error_code()))
            }
        }
    }

    async fn fall_back(&self, question: &str, ctx: &PromptContext, reason: FallbackReason) -> Result<AgentOutcome> {
        tracing::warn!(%reason, "agent falling back to llm strategy");
        let generated = self.fallback.generate(question, ctx).await?;

        Ok(AgentOutcome {
            candidate: generated.candidate,
            plan: None,
            metrics: generated.metrics,
            model: generated.model,
            via_fallback: true,
            fallback_reason: Some(reason),
        })
    }
}

const fn state_name(state: &AgentState) -> &'static str {
    match state {
        AgentState::Planning => "planning",
        AgentState::Drafting { .. } => "drafting",
        AgentState::SelfChecking { .. } => "self_checking",
        AgentState::Done { .. } => "done",
        AgentState::Fallback { .. } => "fallback",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqlDialect;
    use crate::engine::{ColumnSummary, SchemaSummary, TableSummary};
    use crate::generation::Completion;
    use crate::guard::GuardPolicy;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers calls in order, each after a simulated delay
    #[derive(Default)]
    struct Script {
        steps: Mutex<VecDeque<(u64, &'static str)>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Script {
        fn new(steps: &[(u64, &'static str)]) -> Arc<Self> {
            Arc::new(Self { steps: Mutex::new(steps.iter().copied().collect()), prompts: Mutex::default() })
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    impl GenerationClient for Script {
        async fn generate(&self, request: &GenerationRequest) -> Result<Completion> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let step = self.steps.lock().unwrap().pop_front();
            let Some((delay_ms, text)) = step else {
                return Err(AskError::generation_failed("script exhausted"));
            };
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok(Completion {
                text: text.to_string(),
                model: Some("sqlcoder".into()),
                prompt_tokens: 100,
                completion_tokens: 10,
                duration: Duration::from_millis(delay_ms),
            })
        }

        fn model(&self) -> &str {
            "sqlcoder"
        }
    }

    const PLAN: &str = "- use selling joined to products\n- sum QuantitySold per product\n";
    const GOOD: &str = "<SQL>SELECT p.ProductName, SUM(s.QuantitySold) AS Sold FROM dbo.selling AS s JOIN dbo.products AS p ON s.ProductCode = p.ProductCode GROUP BY p.ProductName</SQL>";
    const TYPO: &str = "<SQL>SELECT p.ProductName, SUM(s.QtySold) AS Sold FROM dbo.selling AS s JOIN dbo.products AS p ON s.ProductCode = p.ProductCode GROUP BY p.ProductName</SQL>";
    const FALLBACK: &str = "<SQL>SELECT ProductName FROM dbo.products</SQL>";

    fn ctx() -> PromptContext {
        let column = |name: &str| ColumnSummary { name: name.into(), data_type: "int".into() };
        PromptContext::new(
            SqlDialect::SqlServer,
            Some("dbo".into()),
            SchemaSummary {
                tables: vec![
                    TableSummary { name: "products".into(), columns: vec![column("ProductCode"), column("ProductName")] },
                    TableSummary { name: "selling".into(), columns: vec![column("ProductCode"), column("QuantitySold")] },
                ],
            },
        )
    }

    fn orchestrator(script: &Arc<Script>, config: AgentConfig) -> AgentOrchestrator<Script> {
        let guard = SafetyGuard::new(GuardPolicy::new(SqlDialect::SqlServer, 200, 500));
        let fallback = LlmStrategy::new(Arc::clone(script), guard.clone(), Duration::from_secs(30));
        AgentOrchestrator::new(Arc::clone(script), guard, fallback, config)
    }

    #[test]
    fn test_plan_parsing() {
        let plan = AgentPlan::parse("Plan:\n- tables: selling, products\n* filter last 90 days\n1. group by product\n2) order by revenue\nThat's it.");
        assert_eq!(
            plan.steps,
            vec!["tables: selling, products", "filter last 90 days", "group by product", "order by revenue"]
        );
        assert!(AgentPlan::parse("I would look at the selling table.").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_draft_check_done() {
        let script = Script::new(&[(1000, PLAN), (2000, GOOD), (500, "VERDICT: OK")]);
        let outcome = orchestrator(&script, AgentConfig::default()).run("best sellers", &ctx()).await.unwrap();

        assert!(!outcome.via_fallback);
        assert_eq!(outcome.candidate.provenance, Provenance::Agent);
        assert!(outcome.candidate.sql.starts_with("SELECT TOP 200 p.ProductName"));
        assert_eq!(outcome.plan.unwrap().steps.len(), 2);
        assert_eq!(
            outcome.metrics,
            Metrics { prompt_tokens: 300, completion_tokens: 30, total_tokens: 330, generation_ms: 3500 }
        );
        assert_eq!(outcome.model.as_deref(), Some("sqlcoder"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_planning_timeout_falls_back_with_fallback_metrics_only() {
        let script = Script::new(&[(9000, PLAN), (1200, FALLBACK)]);
        let outcome = orchestrator(&script, AgentConfig::default()).run("best sellers", &ctx()).await.unwrap();

        assert!(outcome.via_fallback);
        assert!(outcome.plan.is_none());
        assert_eq!(outcome.fallback_reason, Some(FallbackReason::Generation("GENERATION_TIMEOUT")));
        assert_eq!(outcome.candidate.provenance, Provenance::Llm);
        assert_eq!(outcome.candidate.sql, "SELECT TOP 200 ProductName FROM dbo.products");
        assert_eq!(outcome.metrics.generation_ms, 1200);
        assert_eq!(outcome.metrics.total_tokens, 110);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_bounds_the_drafting_call() {
        // 7s planning leaves 7s of the 14s budget; the 7.5s draft is abandoned
        let script = Script::new(&[(7000, PLAN), (7500, GOOD), (800, FALLBACK)]);
        let started = Instant::now();
        let outcome = orchestrator(&script, AgentConfig::default()).run("best sellers", &ctx()).await.unwrap();

        assert!(outcome.via_fallback);
        assert_eq!(outcome.metrics.generation_ms, 800);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(14_800) && elapsed < Duration::from_millis(14_810));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_check_feedback_drives_one_redraft() {
        let script = Script::new(&[(100, PLAN), (100, TYPO), (100, GOOD), (100, "VERDICT: OK")]);
        let outcome = orchestrator(&script, AgentConfig::default()).run("best sellers", &ctx()).await.unwrap();

        assert!(!outcome.via_fallback);
        assert!(outcome.candidate.sql.contains("SUM(s.QuantitySold)"));
        assert_eq!(outcome.metrics.total_tokens, 440);

        let prompts = script.prompts();
        assert_eq!(prompts.len(), 4);
        assert!(prompts[2].contains("Reason: unknown column s.QtySold (did you mean s.QuantitySold?)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_negative_verdict_falls_back() {
        let script = Script::new(&[
            (100, PLAN),
            (100, GOOD),
            (100, "VERDICT: FIX should filter by year"),
            (100, GOOD),
            (100, "no idea"),
            (100, FALLBACK),
        ]);
        let outcome = orchestrator(&script, AgentConfig::default()).run("sales this year", &ctx()).await.unwrap();

        assert!(outcome.via_fallback);
        assert!(matches!(outcome.fallback_reason, Some(FallbackReason::Rejected(_))));
        assert_eq!(outcome.metrics.total_tokens, 110);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_plan_falls_back() {
        let script = Script::new(&[(100, "I cannot plan this."), (100, FALLBACK)]);
        let outcome = orchestrator(&script, AgentConfig::default()).run("q", &ctx()).await.unwrap();
        assert_eq!(outcome.fallback_reason, Some(FallbackReason::EmptyPlan));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsafe_draft_is_a_hard_stop() {
        let script = Script::new(&[(100, PLAN), (100, "<SQL>SELECT * INTO dbo.copy FROM dbo.products</SQL>"), (100, FALLBACK)]);
        let err = orchestrator(&script, AgentConfig::default()).run("q", &ctx()).await.unwrap_err();

        assert!(matches!(err, AskError::UnsafeGeneration(_)));
        assert_eq!(script.prompts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_check_can_be_disabled() {
        let config = AgentConfig { self_check_with_model: false, ..AgentConfig::default() };
        let script = Script::new(&[(100, PLAN), (100, GOOD)]);
        let outcome = orchestrator(&script, config).run("best sellers", &ctx()).await.unwrap();

        assert!(!outcome.via_fallback);
        assert_eq!(script.prompts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_failure_propagates() {
        let script = Script::new(&[(9000, PLAN), (100, "no sql here")]);
        let err = orchestrator(&script, AgentConfig::default()).run("q", &ctx()).await.unwrap_err();
        assert_eq!(err.error_code(), "EXTRACTION_ERROR");
    }
}

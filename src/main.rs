//! Askql CLI Entry Point
//!
//! Subcommands:
//! - `ask` - answer a question through the pattern, llm or agent route
//! - `run-sql` - execute caller-supplied SQL after the guard
//! - `presets list` / `presets run` - the saved report queries
//! - `check` - guard only, nothing is executed
//! - `health` - probe the generation service and the database
//! - `mcp` - MCP server mode (hidden, for agent integration)
//!
//! All output to stdout is JSON-only. Logs go to stderr (`ASKQL_LOG`).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use askql::config::AppConfig;
use askql::engine::Executor;
use askql::generation::{GenerationClient, OllamaClient};
use askql::guard::SafetyGuard;
use askql::i18n::Language;
use askql::output::{ErrorEnvelope, SuccessEnvelope};
use askql::preset::PresetCatalog;
use askql::service::{CheckReport, QueryService, Request};
use askql::strategy::Strategy;
use askql::{mcp, AskError};

type Service = QueryService<OllamaClient, Executor>;

/// Askql - natural-language questions to vetted, read-only SQL
#[derive(Parser)]
#[command(name = "askql")]
#[command(about = "Answer questions about a database with vetted, read-only SQL")]
#[command(version)]
struct Cli {
    /// Config file (default: .askql/config.json over ~/.config/askql/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a natural-language question
    Ask {
        /// Strategy producing the SQL
        #[arg(long, value_enum, default_value_t = RouteArg::Pattern)]
        route: RouteArg,

        /// Answer language (detected from the question when omitted)
        #[arg(long, value_enum)]
        lang: Option<LangArg>,

        question: String,
    },

    /// Execute one SELECT statement after the guard
    RunSql {
        #[arg(long, value_enum)]
        lang: Option<LangArg>,

        sql: String,
    },

    /// Saved report queries
    Presets {
        #[command(subcommand)]
        action: PresetAction,
    },

    /// Run the guard on a statement without executing it
    Check {
        #[arg(long, value_enum)]
        lang: Option<LangArg>,

        sql: String,
    },

    /// Probe the generation service and the database
    Health,

    /// Start MCP server (hidden from help, for agent integration)
    #[command(hide = true)]
    Mcp,
}

#[derive(Subcommand)]
enum PresetAction {
    /// Preset names and descriptions
    List,

    /// Execute a preset by name
    Run {
        #[arg(long, value_enum)]
        lang: Option<LangArg>,

        name: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RouteArg {
    Pattern,
    Llm,
    Agent,
}

#[derive(Clone, Copy, ValueEnum)]
enum LangArg {
    Ar,
    En,
}

impl From<LangArg> for Language {
    fn from(lang: LangArg) -> Self {
        match lang {
            LangArg::Ar => Self::Ar,
            LangArg::En => Self::En,
        }
    }
}

impl Commands {
    /// Route reported in envelopes that are not query payloads
    const fn name(&self) -> &'static str {
        match self {
            Self::Ask { .. } => "ask",
            Self::RunSql { .. } => "raw",
            Self::Presets { action: PresetAction::List } => "presets",
            Self::Presets { action: PresetAction::Run { .. } } => "preset",
            Self::Check { .. } => "check",
            Self::Health => "health",
            Self::Mcp => "mcp",
        }
    }
}

/// Result of a health probe
#[derive(Debug, Serialize)]
struct Probe {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
    elapsed_ms: u64,
}

impl Probe {
    fn from_result<T>(started: Instant, result: Result<T, AskError>, detail: impl FnOnce(T) -> String) -> Self {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(value) => Self { ok: true, detail: Some(detail(value)), error: None, elapsed_ms },
            Err(e) => {
                tracing::warn!(error = %e, "health probe failed");
                Self { ok: false, detail: None, error: Some(e.error_code()), elapsed_ms }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct Health {
    generation: Probe,
    database: Probe,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("askql: {e:#}");
            ExitCode::from(2)
        }
    }
}

/// Logs to stderr, filtered by `ASKQL_LOG` (default `warn`)
fn init_logging() {
    let filter = EnvFilter::try_from_env("ASKQL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let route = cli.command.name();
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return fail(route, &e, Language::default()),
    };

    match cli.command {
        Commands::Check { lang, sql } => {
            let lang = lang.map_or_else(Language::default, Language::from);
            let guard = SafetyGuard::new(config.guard_policy(config.effective_dialect()));
            succeed(route, CheckReport::from_verdict(guard.evaluate(&sql), lang))
        }
        Commands::Presets { action: PresetAction::List } => {
            let guard = SafetyGuard::new(config.guard_policy(config.effective_dialect()));
            match PresetCatalog::load(&guard, config.schema.schema.clone(), config.presets_file.as_deref()) {
                Ok(catalog) => succeed(route, catalog.list()),
                Err(e) => fail(route, &e, Language::default()),
            }
        }
        Commands::Ask { route: which, lang, question } => {
            let Some((_, service)) = connect(&config, route)? else {
                return Ok(ExitCode::FAILURE);
            };
            let strategy = match which {
                RouteArg::Pattern => Strategy::Pattern(question),
                RouteArg::Llm => Strategy::Llm(question),
                RouteArg::Agent => Strategy::Agent(question),
            };
            answer(&service, Request::new(strategy).with_language(lang.map(Language::from))).await
        }
        Commands::RunSql { lang, sql } => {
            let Some((_, service)) = connect(&config, route)? else {
                return Ok(ExitCode::FAILURE);
            };
            answer(&service, Request::new(Strategy::Raw(sql)).with_language(lang.map(Language::from))).await
        }
        Commands::Presets { action: PresetAction::Run { lang, name } } => {
            let Some((_, service)) = connect(&config, route)? else {
                return Ok(ExitCode::FAILURE);
            };
            answer(&service, Request::new(Strategy::Preset(name)).with_language(lang.map(Language::from)))
                .await
        }
        Commands::Health => {
            let Some((client, service)) = connect(&config, route)? else {
                return Ok(ExitCode::FAILURE);
            };
            health(&config, &client, &service).await
        }
        Commands::Mcp => {
            let Some((_, service)) = connect(&config, route)? else {
                return Ok(ExitCode::FAILURE);
            };
            mcp::serve(&service).await.context("MCP server failed")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<AppConfig, AskError> {
    match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
}

fn build(config: &AppConfig) -> Result<(Arc<OllamaClient>, Service), AskError> {
    let executor = Executor::from_config(&config.connection()?)?;
    let client = Arc::new(OllamaClient::new(
        config.generation.base_url.clone(),
        config.generation.model.clone(),
        config.generation.keep_alive.clone(),
        config.generation.options.clone(),
    )?);
    let service = QueryService::new(config, Arc::clone(&client), Arc::new(executor))?;
    Ok((client, service))
}

/// Build the service, or print the error envelope and return `None`
fn connect(config: &AppConfig, route: &str) -> anyhow::Result<Option<(Arc<OllamaClient>, Service)>> {
    match build(config) {
        Ok(parts) => Ok(Some(parts)),
        Err(e) => {
            fail(route, &e, Language::default())?;
            Ok(None)
        }
    }
}

async fn answer(service: &Service, request: Request) -> anyhow::Result<ExitCode> {
    let route = request.strategy.route();
    let lang = request.language();
    match service.handle(request).await {
        Ok(payload) => succeed(route.as_str(), payload),
        Err(e) => fail(route.as_str(), &e, lang),
    }
}

async fn health(
    config: &AppConfig,
    client: &OllamaClient,
    service: &Service,
) -> anyhow::Result<ExitCode> {
    let started = Instant::now();
    let generation = Probe::from_result(started, client.health(config.generation.timeout).await, |c| {
        c.model.unwrap_or_else(|| client.model().to_string())
    });

    let started = Instant::now();
    let database = Probe::from_result(
        started,
        service.handle(Request::new(Strategy::Raw("SELECT 1".into()))).await,
        |_| service.dialect().to_string(),
    );

    let healthy = generation.ok && database.ok;
    print_json(&SuccessEnvelope::new("health", Health { generation, database }))?;
    Ok(if healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn succeed(route: &str, data: impl Serialize) -> anyhow::Result<ExitCode> {
    print_json(&SuccessEnvelope::new(route, data))?;
    Ok(ExitCode::SUCCESS)
}

fn fail(route: &str, err: &AskError, lang: Language) -> anyhow::Result<ExitCode> {
    print_json(&ErrorEnvelope::from_error(route, err, lang))?;
    Ok(ExitCode::FAILURE)
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

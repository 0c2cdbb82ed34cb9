//! Askql - natural-language questions to vetted, read-only SQL
//!
//! A question (Arabic or English) becomes exactly one SELECT statement through
//! one of three strategies, the statement passes a token-level safety guard
//! that rejects anything but a single read-only query and bounds its result
//! size, and the vetted statement is executed and packaged into one uniform
//! payload.
//!
//! # Core Principles
//! - Read-only under every route; unsafe generated SQL is a hard stop, never retried
//! - One payload shape for every route, JSON-only output
//! - Explicit fallback (agent to LLM) instead of blind retries
//! - Collaborators passed in at construction, so every timeout is testable
//!
//! # Module Organization
//! - [`guard`] - tokenizer, read-only classification, row-cap rewriting
//! - [`pattern`] - cataloged question shapes rendered per dialect
//! - [`generation`] - generation service client (Ollama)
//! - [`strategy`] - candidate SQL, prompts, completion extraction, LLM strategy
//! - [`agent`] - plan, draft, self-check orchestrator with fallback
//! - [`engine`] - executors for `SQLite`, `PostgreSQL` and `MySQL`
//! - [`preset`] - saved report queries
//! - [`assemble`] - response payload and metrics
//! - [`service`] - the request pipeline
//! - [`config`] - JSON config files and env overrides
//! - [`output`] - JSON output envelopes
//! - [`mcp`] - MCP stdio server

pub mod agent;
pub mod assemble;
pub mod config;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod generation;
pub mod guard;
pub mod i18n;
pub mod mcp;
pub mod output;
pub mod pattern;
pub mod preset;
pub mod service;
pub mod strategy;

// Re-export commonly used types for convenience
pub use assemble::{Metrics, ResponsePayload, Route};
pub use config::AppConfig;
pub use dialect::SqlDialect;
pub use engine::{ConnectionConfig, DatabaseType, ExecutionResult, QueryExecutor};
pub use error::{AskError, Result};
pub use generation::GenerationClient;
pub use guard::{SafetyGuard, SafetyVerdict};
pub use i18n::Language;
pub use output::{ErrorEnvelope, ErrorInfo, SuccessEnvelope};
pub use service::{QueryService, Request};
pub use strategy::Strategy;

//! Configuration Management
//!
//! This module loads the values the pipeline consumes: the database to query,
//! row limits, generation and agent timing, and the guard's schema allow-list.
//!
//! # Configuration Locations
//! - Local: `.askql/config.json` (team-shareable, per-project)
//! - Global: `~/.config/askql/config.json` (per-user)
//!
//! # Resolution Precedence
//! 1. Environment variables (highest priority)
//! 2. Local config file (`.askql/config.json`)
//! 3. Global config file (`~/.config/askql/config.json`)
//! 4. Built-in defaults
//!
//! Files are merged field by field: a local file that only sets `preview_limit`
//! keeps every other value from the global file.
//!
//! # Durations
//! Written as `500ms`, `12s`, `5m`, `1h`, compound `1m30s`, or bare seconds.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::AgentConfig;
use crate::dialect::SqlDialect;
use crate::engine::{ConnectionConfig, SchemaScope};
use crate::error::{AskError, Result};
use crate::generation::OllamaOptions;
use crate::guard::{GuardPolicy, ObjectPolicy};

/// Database section
///
/// Like `ConnectionConfig`, but the password may be read from an environment
/// variable instead of being stored in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// Environment variable holding the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

impl DatabaseSettings {
    /// Resolve `password_env` and return the connection to open
    pub fn resolve(&self) -> Result<ConnectionConfig> {
        let mut config = self.connection.clone();

        if let Some(env_var) = &self.password_env {
            match std::env::var(env_var) {
                Ok(password) => config.password = Some(password),
                Err(_) => {
                    return Err(AskError::config_error(format!(
                        "Environment variable {env_var} not found for password"
                    )));
                }
            }
        }

        Ok(config)
    }
}

/// Generation service section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    pub model: String,
    /// How long the service keeps the model loaded (`"5m"`, `"-1"`)
    pub keep_alive: String,
    #[serde(flatten)]
    pub options: OllamaOptions,
    /// Bound of a single LLM-strategy call
    #[serde(with = "duration")]
    pub timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "codellama:7b-instruct".to_string(),
            keep_alive: "5m".to_string(),
            options: OllamaOptions::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Everything the service is built from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Database to query; not needed by `check`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseSettings>,

    /// Dialect override; defaults to the database engine's dialect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialect: Option<SqlDialect>,

    /// Row cap inserted into uncapped statements
    pub preview_limit: u64,

    /// Ceiling for explicit caps and for fetched rows
    pub max_rows: u64,

    /// Schemas a two-part name may use; empty disables the object policy
    pub allowed_schemas: Vec<String>,

    /// Tables described to the model
    pub schema: SchemaScope,

    pub generation: GenerationConfig,

    pub agent: AgentConfig,

    #[serde(with = "duration")]
    pub execution_timeout: Duration,

    /// Answer unmatched pattern questions with the LLM strategy
    pub pattern_fallback: bool,

    /// JSON file with extra presets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presets_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: None,
            dialect: None,
            preview_limit: 200,
            max_rows: 500,
            allowed_schemas: Vec::new(),
            schema: SchemaScope::default(),
            generation: GenerationConfig::default(),
            agent: AgentConfig::default(),
            execution_timeout: Duration::from_secs(30),
            pattern_fallback: true,
            presets_file: None,
        }
    }
}

impl AppConfig {
    /// Load with precedence: env over local over global over defaults
    pub fn load() -> Result<Self> {
        let global = read_layer(&global_config_path()?)?;
        let local = read_layer(&local_config_path()?)?;
        let mut config = Self::from_layers([global, local].into_iter().flatten())?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load one explicit file, then apply the environment
    pub fn load_from(path: &Path) -> Result<Self> {
        let layer = read_layer(path)?
            .ok_or_else(|| AskError::config_error(format!("Config file {} not found", path.display())))?;
        let mut config = Self::from_layers([layer])?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Merge JSON layers in order, later layers winning field by field
    pub fn from_layers(layers: impl IntoIterator<Item = Value>) -> Result<Self> {
        let mut merged = Value::Object(serde_json::Map::new());
        for layer in layers {
            merge(&mut merged, layer);
        }
        serde_json::from_value(merged)
            .map_err(|e| AskError::config_error(format!("Invalid config file format: {e}")))
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("ASKQL_PREVIEW_LIMIT") {
            self.preview_limit = parse_count("ASKQL_PREVIEW_LIMIT", &v)?;
        }
        if let Some(v) = lookup("ASKQL_MAX_ROWS") {
            self.max_rows = parse_count("ASKQL_MAX_ROWS", &v)?;
        }
        if let Some(v) = lookup("OLLAMA_MODEL") {
            self.generation.model = v;
        }
        if let Some(v) = lookup("OLLAMA_BASE_URL") {
            self.generation.base_url = v;
        }
        if let Some(v) = lookup("OLLAMA_TIMEOUT") {
            self.generation.timeout = parse_duration(&v)?;
        }
        if let Some(v) = lookup("ASKQL_AGENT_TIMEOUT") {
            self.agent.call_timeout = parse_duration(&v)?;
        }
        if let Some(v) = lookup("ASKQL_AGENT_BUDGET") {
            self.agent.budget = parse_duration(&v)?;
        }
        Ok(())
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.preview_limit == 0 {
            return Err(AskError::config_error("preview_limit must be greater than 0"));
        }
        if self.max_rows < self.preview_limit {
            return Err(AskError::config_error(format!(
                "max_rows ({}) must be at least preview_limit ({})",
                self.max_rows, self.preview_limit
            )));
        }
        let durations = [
            ("generation.timeout", self.generation.timeout),
            ("agent.call_timeout", self.agent.call_timeout),
            ("agent.budget", self.agent.budget),
            ("execution_timeout", self.execution_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(AskError::config_error(format!("{name} must be greater than 0")));
        }
        Ok(())
    }

    /// Database connection with its password resolved
    pub fn connection(&self) -> Result<ConnectionConfig> {
        self.database
            .as_ref()
            .ok_or_else(|| AskError::config_error("No database configured. Add a \"database\" section."))?
            .resolve()
    }

    /// Explicit dialect, else the database engine's, else SQL Server
    #[must_use]
    pub fn effective_dialect(&self) -> SqlDialect {
        self.dialect
            .or_else(|| self.database.as_ref().map(|d| d.connection.engine.dialect()))
            .unwrap_or(SqlDialect::SqlServer)
    }

    /// Guard policy for `dialect`
    #[must_use]
    pub fn guard_policy(&self, dialect: SqlDialect) -> GuardPolicy {
        GuardPolicy::new(dialect, self.preview_limit, self.max_rows)
            .with_objects(ObjectPolicy::allow_schemas(self.allowed_schemas.iter().cloned()))
    }
}

/// Get path to local config file (`.askql/config.json`)
pub fn local_config_path() -> Result<PathBuf> {
    let current_dir = std::env::current_dir().map_err(|e| {
        AskError::config_error(format!("Could not determine current directory: {e}"))
    })?;

    Ok(current_dir.join(".askql").join("config.json"))
}

/// Get path to global config file (`~/.config/askql/config.json`)
pub fn global_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| AskError::config_error("Could not determine user config directory"))?;

    Ok(config_dir.join("askql").join("config.json"))
}

/// Read a config file as JSON; a missing file is `None`
fn read_layer(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| AskError::config_error(format!("Could not read config file: {e}")))?;

    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| AskError::config_error(format!("Invalid config file {}: {e}", path.display())))
}

/// Recursive object merge; non-object values replace
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn parse_count(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| AskError::config_error(format!("{name} must be a non-negative integer, got '{value}'")))
}

/// Parse `500ms`, `12s`, `5m`, `1h`, `1m30s` or bare seconds (`8`, `2.5`)
pub fn parse_duration(input: &str) -> Result<Duration> {
    let text = input.trim().to_ascii_lowercase();
    let invalid = || AskError::config_error(format!("Invalid duration '{input}'"));

    if text.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = text.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|_| invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = text.as_str();
    while !rest.is_empty() {
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.').len();
        if digits == 0 {
            return Err(invalid());
        }
        let amount: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()).len();
        let seconds_per = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        total += Duration::try_from_secs_f64(amount * seconds_per).map_err(|_| invalid())?;
    }

    Ok(total)
}

/// Compact rendering that [`parse_duration`] reads back
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        return format!("{ms}ms");
    }
    let secs = ms / 1000;
    match (secs / 3600, secs % 3600 / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, 0) => format!("{m}m"),
        (h, 0, 0) => format!("{h}h"),
        (h, m, s) => {
            let mut out = String::new();
            if h > 0 {
                out.push_str(&format!("{h}h"));
            }
            if m > 0 {
                out.push_str(&format!("{m}m"));
            }
            if s > 0 {
                out.push_str(&format!("{s}s"));
            }
            out
        }
    }
}

/// Serde adapter for durations written as strings or bare seconds
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

//! Query Executors and Core Types
//!
//! This module defines the executor abstraction that runs a vetted statement
//! and describes the schema the prompts are built from. Each bundled engine
//! (`PostgreSQL`, `MySQL`, `SQLite`) implements [`QueryExecutor`] in its own
//! module behind a cargo feature.
//!
//! # Executor Contract
//! - Statements arrive already accepted by the guard; executors never vet SQL
//! - At most `max_rows` rows are fetched; the rest are never read
//! - The execution timeout is fatal and surfaces as `ExecutionFailed`
//! - Results are all-or-nothing: a row conversion failure fails the call
//!
//! Engines share only the types in this module; each adapter owns its
//! driver, its value conversion and its introspection queries.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use crate::dialect::SqlDialect;
use crate::error::{AskError, Result};

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Supported database engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// `PostgreSQL` database
    Postgres,
    /// `MySQL` database (includes `MariaDB`)
    MySQL,
    /// `SQLite` database
    SQLite,
}

impl DatabaseType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySQL => "mysql",
            Self::SQLite => "sqlite",
        }
    }

    /// SQL dialect spoken by this engine
    #[must_use]
    pub const fn dialect(&self) -> SqlDialect {
        match self {
            Self::Postgres => SqlDialect::Postgres,
            Self::MySQL => SqlDialect::MySql,
            Self::SQLite => SqlDialect::Sqlite,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the executor connects
///
/// `SQLite` needs only `file`; the server engines need `host`, `user` and
/// `database`, with `port` falling back to the engine default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub engine: DatabaseType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Never logged and never part of an error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Database (catalog) name on the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl ConnectionConfig {
    /// Connection to a `PostgreSQL` or `MySQL` server
    #[must_use]
    pub fn server(
        engine: DatabaseType,
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            host: Some(host.into()),
            port: Some(port),
            user: Some(user.into()),
            password: Some(password.into()),
            database: Some(database.into()),
            file: None,
        }
    }

    /// Connection to a `SQLite` file
    #[must_use]
    pub const fn sqlite(file: PathBuf) -> Self {
        Self {
            engine: DatabaseType::SQLite,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            file: Some(file),
        }
    }
}

/// Per-call execution bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    /// Rows beyond this are not fetched
    pub max_rows: usize,
    pub timeout: Duration,
}

/// Tabular result of one statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Unique column names in projection order
    pub columns: Vec<String>,
    /// One JSON object per row, keys in column order
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

impl ExecutionResult {
    /// Build from raw column names and positional rows
    ///
    /// Duplicate names are suffixed (`name`, `name_2`, ...) so that no value is
    /// lost when rows become objects.
    #[must_use]
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        let columns = unique_columns(columns);
        let rows = rows
            .into_iter()
            .map(|values| columns.iter().cloned().zip(values).collect())
            .collect();
        Self { columns, rows }
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Make column names unique, preserving order
#[must_use]
pub fn unique_columns(columns: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    columns
        .into_iter()
        .map(|name| {
            if seen.insert(name.clone()) {
                return name;
            }
            let mut n = 2;
            loop {
                let candidate = format!("{name}_{n}");
                if seen.insert(candidate.clone()) {
                    return candidate;
                }
                n += 1;
            }
        })
        .collect()
}

/// Which part of the database the prompts describe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaScope {
    /// Schema the tables live in (`dbo`, `public`); `None` for `SQLite`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Tables to describe; empty means every user table
    #[serde(default)]
    pub tables: Vec<String>,
}

impl SchemaScope {
    /// Whether `table` is in scope (case-insensitive)
    #[must_use]
    pub fn includes(&self, table: &str) -> bool {
        self.tables.is_empty() || self.tables.iter().any(|t| t.eq_ignore_ascii_case(table))
    }
}

/// Column name and engine type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub name: String,
    pub data_type: String,
}

/// Table and its columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    /// Empty when only the table name is known
    pub columns: Vec<ColumnSummary>,
}

/// The schema as the prompts see it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSummary {
    pub tables: Vec<TableSummary>,
}

impl SchemaSummary {
    /// Table names only, used when introspection failed
    #[must_use]
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: names
                .into_iter()
                .map(|n| TableSummary { name: n.into(), columns: Vec::new() })
                .collect(),
        }
    }

    /// Whether any column information is known
    #[must_use]
    pub fn has_columns(&self) -> bool {
        self.tables.iter().any(|t| !t.columns.is_empty())
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableSummary> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Every known column name across tables
    pub fn all_columns(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().flat_map(|t| t.columns.iter().map(|c| c.name.as_str()))
    }
}

/// Runs vetted statements against one database
pub trait QueryExecutor: Send + Sync {
    /// Execute a guard-accepted statement
    fn execute(
        &self,
        sql: &str,
        limits: &ExecLimits,
    ) -> impl Future<Output = Result<ExecutionResult>> + Send;

    /// Describe the tables in `scope`
    fn describe_schema(
        &self,
        scope: &SchemaScope,
    ) -> impl Future<Output = Result<SchemaSummary>> + Send;

    /// Dialect of the underlying database
    fn dialect(&self) -> SqlDialect;
}

/// Bundled executors, dispatched on [`DatabaseType`]
#[derive(Debug)]
pub enum Executor {
    #[cfg(feature = "sqlite")]
    Sqlite(sqlite::SqliteExecutor),
    #[cfg(feature = "postgres")]
    Postgres(postgres::PostgresExecutor),
    #[cfg(feature = "mysql")]
    MySql(mysql::MySqlExecutor),
}

impl Executor {
    /// Build the executor for `config.engine`
    ///
    /// Fails with `ConfigError` when the engine was compiled out or the
    /// configuration is incomplete. No connection is opened here.
    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        match config.engine {
            #[cfg(feature = "sqlite")]
            DatabaseType::SQLite => Ok(Self::Sqlite(sqlite::SqliteExecutor::from_config(config)?)),
            #[cfg(feature = "postgres")]
            DatabaseType::Postgres => {
                Ok(Self::Postgres(postgres::PostgresExecutor::from_config(config)?))
            }
            #[cfg(feature = "mysql")]
            DatabaseType::MySQL => Ok(Self::MySql(mysql::MySqlExecutor::from_config(config)?)),
            #[allow(unreachable_patterns)]
            other => Err(AskError::config_error(format!(
                "Engine {other} is not enabled in this build"
            ))),
        }
    }
}

impl QueryExecutor for Executor {
    async fn execute(&self, sql: &str, limits: &ExecLimits) -> Result<ExecutionResult> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(e) => e.execute(sql, limits).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(e) => e.execute(sql, limits).await,
            #[cfg(feature = "mysql")]
            Self::MySql(e) => e.execute(sql, limits).await,
        }
    }

    async fn describe_schema(&self, scope: &SchemaScope) -> Result<SchemaSummary> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(e) => e.describe_schema(scope).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(e) => e.describe_schema(scope).await,
            #[cfg(feature = "mysql")]
            Self::MySql(e) => e.describe_schema(scope).await,
        }
    }

    fn dialect(&self) -> SqlDialect {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(e) => e.dialect(),
            #[cfg(feature = "postgres")]
            Self::Postgres(e) => e.dialect(),
            #[cfg(feature = "mysql")]
            Self::MySql(e) => e.dialect(),
        }
    }
}

/// Map a driver timeout to the fatal execution error
pub(crate) fn execution_timeout(timeout: Duration) -> AskError {
    AskError::execution_failed(format!(
        "Query exceeded the execution timeout of {}ms",
        timeout.as_millis()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_database_type_serialization() {
        assert_eq!(serde_json::to_string(&DatabaseType::Postgres).unwrap(), r#""postgres""#);
        assert_eq!(serde_json::to_string(&DatabaseType::MySQL).unwrap(), r#""mysql""#);
        assert_eq!(serde_json::to_string(&DatabaseType::SQLite).unwrap(), r#""sqlite""#);
    }

    #[test]
    fn test_database_type_dialect() {
        assert_eq!(DatabaseType::SQLite.dialect(), SqlDialect::Sqlite);
        assert_eq!(DatabaseType::MySQL.dialect(), SqlDialect::MySql);
        assert_eq!(DatabaseType::Postgres.dialect(), SqlDialect::Postgres);
    }

    #[test]
    fn test_server_and_file_connections() {
        let pg = ConnectionConfig::server(DatabaseType::Postgres, "localhost", 5432, "user", "pass", "db");
        assert_eq!(pg.engine, DatabaseType::Postgres);
        assert_eq!(pg.port, Some(5432));

        let sqlite = ConnectionConfig::sqlite(PathBuf::from("/tmp/shop.db"));
        assert_eq!(sqlite.engine, DatabaseType::SQLite);
        assert!(sqlite.host.is_none());
    }

    #[test]
    fn test_unique_columns() {
        let cols = unique_columns(vec!["id".into(), "name".into(), "id".into(), "id".into(), "id_2".into()]);
        assert_eq!(cols, vec!["id", "name", "id_2", "id_3", "id_2_2"]);
    }

    #[test]
    fn test_from_rows_keeps_projection_order() {
        let result = ExecutionResult::from_rows(
            vec!["z".into(), "a".into(), "z".into()],
            vec![vec![json!(1), json!("x"), json!(null)]],
        );
        assert_eq!(result.columns, vec!["z", "a", "z_2"]);
        let keys: Vec<&String> = result.rows[0].keys().collect();
        assert_eq!(keys, vec!["z", "a", "z_2"]);
        assert_eq!(result.rows[0]["z_2"], json!(null));
    }

    #[test]
    fn test_schema_scope_includes() {
        let scope = SchemaScope { schema: None, tables: vec!["Products".into()] };
        assert!(scope.includes("products"));
        assert!(!scope.includes("selling"));
        assert!(SchemaScope::default().includes("anything"));
    }

    #[test]
    fn test_schema_summary_from_names() {
        let summary = SchemaSummary::from_names(["products", "selling"]);
        assert!(!summary.has_columns());
        assert!(summary.table("PRODUCTS").is_some());
    }
}

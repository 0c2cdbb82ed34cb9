//! `SQLite` Executor
//!
//! Runs vetted statements against a `SQLite` file.
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous driver) on tokio's blocking pool
//! - Every call opens its own read-only connection
//! - The statement is interrupted when the execution timeout elapses or the
//!   calling future is dropped
//! - BLOB data is Base64-encoded for JSON safety
//! - Row limits enforced while stepping; later rows are never read

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, InterruptHandle, OpenFlags, Row};

use crate::dialect::SqlDialect;
use crate::engine::{
    execution_timeout, ColumnSummary, ConnectionConfig, DatabaseType, ExecLimits,
    ExecutionResult, QueryExecutor, SchemaScope, SchemaSummary, TableSummary,
};
use crate::error::{AskError, Result};

/// Introspection runs under this bound regardless of the execution timeout
const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// `SQLite` executor bound to one database file
#[derive(Debug, Clone)]
pub struct SqliteExecutor {
    path: PathBuf,
}

impl SqliteExecutor {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        if config.engine != DatabaseType::SQLite {
            return Err(AskError::config_error(format!(
                "Expected SQLite engine, got {}",
                config.engine
            )));
        }
        let file = config
            .file
            .as_ref()
            .ok_or_else(|| AskError::config_error("SQLite requires 'file' parameter"))?;
        Ok(Self::new(file.clone()))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `work` on the blocking pool, interrupting it on timeout or drop
    async fn run_blocking<T, F>(&self, timeout: Duration, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = open_connection(&self.path)?;
        conn.busy_timeout(timeout)
            .map_err(|e| AskError::execution_failed(format!("Failed to set busy timeout: {e}")))?;

        let mut interrupt = InterruptOnDrop(Some(conn.get_interrupt_handle()));
        let task = tokio::task::spawn_blocking(move || work(&conn));

        let joined = tokio::time::timeout(timeout, task).await.map_err(|_| {
            tracing::warn!(path = %self.path.display(), "SQLite statement interrupted after timeout");
            execution_timeout(timeout)
        })?;
        interrupt.disarm();

        joined.map_err(|e| AskError::execution_failed(format!("SQLite worker failed: {e}")))?
    }
}

impl QueryExecutor for SqliteExecutor {
    async fn execute(&self, sql: &str, limits: &ExecLimits) -> Result<ExecutionResult> {
        let sql = sql.to_string();
        let max_rows = limits.max_rows;
        self.run_blocking(limits.timeout, move |conn| execute_query(conn, &sql, max_rows)).await
    }

    async fn describe_schema(&self, scope: &SchemaScope) -> Result<SchemaSummary> {
        let scope = scope.clone();
        self.run_blocking(DESCRIBE_TIMEOUT, move |conn| describe(conn, &scope)).await
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }
}

/// Interrupts the running statement unless disarmed
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.interrupt();
        }
    }
}

/// Open a read-only connection; the file must exist
fn open_connection(path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    Connection::open_with_flags(path, flags)
        .map_err(|e| AskError::execution_failed(format!("Failed to open SQLite database: {e}")))
}

/// Execute query and collect at most `max_rows` rows
fn execute_query(conn: &Connection, query: &str, max_rows: usize) -> Result<ExecutionResult> {
    let mut stmt = conn
        .prepare(query)
        .map_err(|e| AskError::execution_failed(format!("Failed to prepare query: {e}")))?;

    let column_names: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();

    let mut rows = stmt
        .query([])
        .map_err(|e| AskError::execution_failed(format!("Failed to execute query: {e}")))?;

    let mut rows_data = Vec::new();
    while rows_data.len() < max_rows {
        let Some(row) = rows
            .next()
            .map_err(|e| AskError::execution_failed(format!("Failed to fetch row: {e}")))?
        else {
            break;
        };
        let values = row_to_json(column_names.len(), row)
            .map_err(|e| AskError::execution_failed(format!("Failed to convert row: {e}")))?;
        rows_data.push(values);
    }

    Ok(ExecutionResult::from_rows(column_names, rows_data))
}

/// List in-scope tables and views with their columns
fn describe(conn: &Connection, scope: &SchemaScope) -> Result<SchemaSummary> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .map_err(|e| AskError::execution_failed(format!("Failed to list tables: {e}")))?;

    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .and_then(Iterator::collect::<std::result::Result<Vec<_>, _>>)
        .map_err(|e| AskError::execution_failed(format!("Failed to list tables: {e}")))?;

    let mut tables = Vec::new();
    for name in names.into_iter().filter(|n| scope.includes(n)) {
        let columns = table_columns(conn, &name)?;
        tables.push(TableSummary { name, columns });
    }

    Ok(SchemaSummary { tables })
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnSummary>> {
    let pragma = format!("PRAGMA table_info({})", SqlDialect::Sqlite.quote_ident(table));
    let mut stmt = conn.prepare(&pragma).map_err(|e| {
        AskError::execution_failed(format!("Failed to prepare table_info for {table}: {e}"))
    })?;

    let columns = stmt
        .query_map([], |row| Ok(ColumnSummary { name: row.get(1)?, data_type: row.get(2)? }))
        .and_then(Iterator::collect::<std::result::Result<Vec<_>, _>>)
        .map_err(|e| {
            AskError::execution_failed(format!("Failed to read columns for {table}: {e}"))
        })?;
    Ok(columns)
}

/// Convert a `SQLite` row to a JSON-safe `Vec`
fn row_to_json(
    width: usize,
    row: &Row,
) -> std::result::Result<Vec<serde_json::Value>, rusqlite::Error> {
    (0..width).map(|idx| sqlite_value_to_json(row, idx)).collect()
}

/// Convert `SQLite` value to JSON value
fn sqlite_value_to_json(
    row: &Row,
    idx: usize,
) -> std::result::Result<serde_json::Value, rusqlite::Error> {
    use rusqlite::types::ValueRef;

    Ok(match row.get_ref(idx)? {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        // NaN/Infinity have no JSON form
        ValueRef::Real(f) => {
            serde_json::Number::from_f64(f).map_or(serde_json::Value::Null, serde_json::Value::Number)
        }
        ValueRef::Text(s) => {
            let text = std::str::from_utf8(s).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
            })?;
            serde_json::Value::String(text.to_string())
        }
        ValueRef::Blob(b) => {
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Create a fresh database file seeded by `setup`
    fn create_test_db(name: &str, setup: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("askql_{name}_{}_{nanos}.db", std::process::id()));
        let conn = Connection::open(&path).expect("Failed to create temp database");
        conn.execute_batch(setup).expect("Failed to seed temp database");
        path
    }

    fn limits(max_rows: usize) -> ExecLimits {
        ExecLimits { max_rows, timeout: Duration::from_secs(5) }
    }

    const SHOP: &str = "
        CREATE TABLE products (ProductCode TEXT PRIMARY KEY, ProductName TEXT, Quantity INTEGER);
        CREATE TABLE selling (SellingID INTEGER PRIMARY KEY, ProductCode TEXT, QuantitySold INTEGER, SellingPrice REAL);
        INSERT INTO products VALUES ('P1', 'Tea', 3), ('P2', 'Coffee', 12), ('P3', 'Sugar', 0);
        INSERT INTO selling (ProductCode, QuantitySold, SellingPrice) VALUES ('P1', 2, 4.5), ('P2', 1, 10.0);
    ";

    #[test]
    fn test_from_config_requires_file() {
        let mut config = ConnectionConfig::sqlite(PathBuf::from("shop.db"));
        assert!(SqliteExecutor::from_config(&config).is_ok());

        config.file = None;
        let err = SqliteExecutor::from_config(&config).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[tokio::test]
    async fn test_execute_select_query() {
        let path = create_test_db("select", SHOP);
        let executor = SqliteExecutor::new(&path);

        let result = executor
            .execute("SELECT ProductCode, Quantity FROM products ORDER BY ProductCode", &limits(10))
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["ProductCode", "Quantity"]);
        assert_eq!(result.row_count(), 3);
        assert_eq!(result.rows[0]["ProductCode"], json!("P1"));
        assert_eq!(result.rows[1]["Quantity"], json!(12));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_execute_max_rows_limit() {
        let path = create_test_db("max_rows", SHOP);
        let executor = SqliteExecutor::new(&path);

        let result = executor.execute("SELECT * FROM products", &limits(2)).await.unwrap();
        assert_eq!(result.row_count(), 2);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_duplicate_columns_are_suffixed() {
        let path = create_test_db("dup_columns", SHOP);
        let executor = SqliteExecutor::new(&path);

        let result = executor
            .execute(
                "SELECT p.ProductCode, s.ProductCode FROM products p JOIN selling s ON s.ProductCode = p.ProductCode",
                &limits(10),
            )
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["ProductCode", "ProductCode_2"]);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_execute_all_data_types() {
        let path = create_test_db(
            "types",
            "CREATE TABLE t (i INTEGER, r REAL, s TEXT, b BLOB, n TEXT);
             INSERT INTO t VALUES (42, 2.5, 'hello', X'DEADBEEF', NULL);",
        );
        let executor = SqliteExecutor::new(&path);

        let result = executor.execute("SELECT * FROM t", &limits(10)).await.unwrap();
        let row = &result.rows[0];
        assert_eq!(row["i"], json!(42));
        assert_eq!(row["r"], json!(2.5));
        assert_eq!(row["s"], json!("hello"));
        assert_eq!(row["b"], json!("3q2+7w=="));
        assert_eq!(row["n"], json!(null));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_connection_is_read_only() {
        let path = create_test_db("read_only", SHOP);
        let executor = SqliteExecutor::new(&path);

        let err = executor.execute("DELETE FROM products", &limits(10)).await.unwrap_err();
        assert_eq!(err.error_code(), "EXECUTION_FAILED");

        let result = executor.execute("SELECT COUNT(*) AS n FROM products", &limits(10)).await.unwrap();
        assert_eq!(result.rows[0]["n"], json!(3));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_missing_table_is_execution_error() {
        let path = create_test_db("missing_table", SHOP);
        let executor = SqliteExecutor::new(&path);

        let err = executor.execute("SELECT * FROM nope", &limits(10)).await.unwrap_err();
        assert!(matches!(err, AskError::ExecutionFailed(_)));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let executor = SqliteExecutor::new(std::env::temp_dir().join("askql_does_not_exist.db"));
        let err = executor.execute("SELECT 1", &limits(10)).await.unwrap_err();
        assert_eq!(err.error_code(), "EXECUTION_FAILED");
    }

    #[tokio::test]
    async fn test_runaway_query_is_interrupted() {
        let path = create_test_db("runaway", SHOP);
        let executor = SqliteExecutor::new(&path);

        let started = std::time::Instant::now();
        let err = executor
            .execute(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT COUNT(*) FROM c",
                &ExecLimits { max_rows: 10, timeout: Duration::from_millis(200) },
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("timeout"));
        assert!(started.elapsed() < Duration::from_secs(5));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_describe_schema() {
        let path = create_test_db("describe", SHOP);
        let executor = SqliteExecutor::new(&path);

        let summary = executor.describe_schema(&SchemaScope::default()).await.unwrap();
        let names: Vec<&str> = summary.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["products", "selling"]);

        let products = summary.table("products").unwrap();
        assert_eq!(
            products.columns[0],
            ColumnSummary { name: "ProductCode".into(), data_type: "TEXT".into() }
        );
        assert_eq!(products.columns.len(), 3);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_describe_schema_respects_scope() {
        let path = create_test_db("describe_scope", SHOP);
        let executor = SqliteExecutor::new(&path);

        let scope = SchemaScope { schema: None, tables: vec!["SELLING".into()] };
        let summary = executor.describe_schema(&scope).await.unwrap();
        assert_eq!(summary.tables.len(), 1);
        assert_eq!(summary.tables[0].name, "selling");
        assert!(summary.has_columns());

        let _ = std::fs::remove_file(&path);
    }
}

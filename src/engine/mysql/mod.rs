//! MySQL Executor (including MariaDB)
//!
//! # Implementation Notes
//! - Uses `mysql_async` (async driver, requires tokio runtime)
//! - One connection per call, inside a `READ ONLY` transaction
//! - Statements run over the binary protocol so numbers keep their type
//! - DECIMAL values become JSON numbers
//! - Text-like BLOB data stays text; anything else is Base64-encoded
//! - Timeouts enforced via `tokio::time::timeout` plus `max_execution_time`
//!   where the server supports it
//! - Row limits enforced while streaming; later rows are never decoded

use std::collections::BTreeMap;

use mysql_async::consts::ColumnType;
use mysql_async::{prelude::*, Conn, OptsBuilder, Row, Value};

use crate::dialect::SqlDialect;
use crate::engine::{
    execution_timeout, ColumnSummary, ConnectionConfig, DatabaseType, ExecLimits,
    ExecutionResult, QueryExecutor, SchemaScope, SchemaSummary, TableSummary,
};
use crate::error::{AskError, Result};

/// MySQL executor for one database
#[derive(Debug, Clone)]
pub struct MySqlExecutor {
    opts: OptsBuilder,
}

impl MySqlExecutor {
    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        if config.engine != DatabaseType::MySQL {
            return Err(AskError::config_error(format!(
                "Expected MySQL engine, got {}",
                config.engine
            )));
        }
        Ok(Self { opts: build_mysql_opts(config)? })
    }

    async fn connect(&self) -> Result<Conn> {
        Conn::new(self.opts.clone())
            .await
            .map_err(|e| AskError::execution_failed(format!("Failed to connect to MySQL: {e}")))
    }
}

impl QueryExecutor for MySqlExecutor {
    async fn execute(&self, sql: &str, limits: &ExecLimits) -> Result<ExecutionResult> {
        tokio::time::timeout(limits.timeout, async {
            let mut conn = self.connect().await?;
            execute_query(&mut conn, sql, limits).await
        })
        .await
        .map_err(|_| execution_timeout(limits.timeout))?
    }

    async fn describe_schema(&self, scope: &SchemaScope) -> Result<SchemaSummary> {
        let mut conn = self.connect().await?;
        let summary = describe(&mut conn, scope).await?;

        if let Err(e) = conn.disconnect().await {
            tracing::debug!(error = %e, "MySQL disconnect failed");
        }
        Ok(summary)
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::MySql
    }
}

/// Build MySQL connection options from `ConnectionConfig`
fn build_mysql_opts(config: &ConnectionConfig) -> Result<OptsBuilder> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| AskError::config_error("MySQL requires 'host' parameter"))?;

    let port = config
        .port
        .ok_or_else(|| AskError::config_error("MySQL requires 'port' parameter"))?;

    let user = config
        .user
        .as_ref()
        .ok_or_else(|| AskError::config_error("MySQL requires 'user' parameter"))?;

    let database = config
        .database
        .as_ref()
        .ok_or_else(|| AskError::config_error("MySQL requires 'database' parameter"))?;

    let opts = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(port)
        .user(Some(user))
        .pass(config.password.as_ref())
        .db_name(Some(database));

    Ok(opts)
}

async fn execute_query(conn: &mut Conn, query: &str, limits: &ExecLimits) -> Result<ExecutionResult> {
    let timeout_ms = limits.timeout.as_millis().max(1);
    // MariaDB has no max_execution_time; the outer timeout still applies
    if let Err(e) = conn.query_drop(format!("SET SESSION max_execution_time = {timeout_ms}")).await {
        tracing::debug!(error = %e, "max_execution_time not supported");
    }

    conn.query_drop("START TRANSACTION READ ONLY")
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to start transaction: {e}")))?;

    let mut result = conn
        .exec_iter(query, ())
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to execute query: {e}")))?;

    let column_names: Vec<String> = result
        .columns()
        .map(|cols| cols.iter().map(|c| c.name_str().to_string()).collect())
        .unwrap_or_default();

    let mut rows_data = Vec::new();
    while rows_data.len() < limits.max_rows {
        let Some(row) = result
            .next()
            .await
            .map_err(|e| AskError::execution_failed(format!("Failed to fetch row: {e}")))?
        else {
            break;
        };
        rows_data.push(row_to_json(&row)?);
    }

    // Remaining rows are discarded with the connection
    drop(result);

    Ok(ExecutionResult::from_rows(column_names, rows_data))
}

async fn describe(conn: &mut Conn, scope: &SchemaScope) -> Result<SchemaSummary> {
    let query = "SELECT table_name, column_name, data_type
                 FROM information_schema.columns
                 WHERE table_schema = COALESCE(?, DATABASE())
                 ORDER BY table_name, ordinal_position";

    let rows: Vec<(String, String, String)> = conn
        .exec(query, (scope.schema.clone(),))
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to query columns: {e}")))?;

    let mut tables: BTreeMap<String, Vec<ColumnSummary>> = BTreeMap::new();
    for (table, name, data_type) in rows {
        if scope.includes(&table) {
            tables.entry(table).or_default().push(ColumnSummary { name, data_type });
        }
    }

    Ok(SchemaSummary {
        tables: tables.into_iter().map(|(name, columns)| TableSummary { name, columns }).collect(),
    })
}

/// Convert a MySQL row to a JSON-safe `Vec`
fn row_to_json(row: &Row) -> Result<Vec<serde_json::Value>> {
    (0..row.len()).map(|idx| mysql_value_to_json(row, idx)).collect()
}

fn float_to_json(v: f64) -> serde_json::Value {
    // NaN/Infinity have no JSON form
    serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

/// Convert MySQL value to JSON value
fn mysql_value_to_json(row: &Row, idx: usize) -> Result<serde_json::Value> {
    let value = row
        .as_ref(idx)
        .ok_or_else(|| AskError::execution_failed(format!("Failed to get value at index {idx}")))?;

    let is_decimal = matches!(
        row.columns_ref()[idx].column_type(),
        ColumnType::MYSQL_TYPE_NEWDECIMAL | ColumnType::MYSQL_TYPE_DECIMAL
    );

    let json_value = match value {
        Value::NULL => serde_json::Value::Null,

        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) if is_decimal => {
                s.parse::<f64>().map_or_else(|_| serde_json::Value::String(s.to_string()), float_to_json)
            }
            Ok(s) => serde_json::Value::String(s.to_string()),
            Err(_) => {
                use base64::Engine;
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
        },

        Value::Int(i) => serde_json::Value::from(*i),
        Value::UInt(u) => serde_json::Value::from(*u),
        Value::Float(f) => float_to_json(f64::from(*f)),
        Value::Double(d) => float_to_json(*d),

        Value::Date(year, month, day, hour, minute, second, micro) => {
            let text = if (*hour, *minute, *second, *micro) == (0, 0, 0, 0) {
                format!("{year:04}-{month:02}-{day:02}")
            } else if *micro == 0 {
                format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}")
            } else {
                format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micro:06}")
            };
            serde_json::Value::String(text)
        }

        Value::Time(is_negative, days, hours, minutes, seconds, micro) => {
            let sign = if *is_negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            let text = if *micro == 0 {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}")
            } else {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micro:06}")
            };
            serde_json::Value::String(text)
        }
    };

    Ok(json_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests marked #[ignore] need a running MySQL instance:
    // cargo test --features mysql -- --ignored

    fn local_config() -> ConnectionConfig {
        ConnectionConfig::server(DatabaseType::MySQL, "localhost", 3306, "root", "password", "test")
    }

    #[test]
    fn test_wrong_engine_rejected() {
        let mut config = local_config();
        config.engine = DatabaseType::Postgres;

        let err = MySqlExecutor::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("Expected MySQL engine"));
    }

    #[test]
    fn test_missing_host_rejected() {
        let mut config = local_config();
        config.host = None;

        let err = MySqlExecutor::from_config(&config).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
        assert!(err.to_string().contains("MySQL requires 'host' parameter"));
    }

    #[test]
    fn test_dialect() {
        let executor = MySqlExecutor::from_config(&local_config()).unwrap();
        assert_eq!(executor.dialect(), SqlDialect::MySql);
    }

    #[tokio::test]
    #[ignore = "Requires running MySQL instance"]
    async fn test_execute_select_query() {
        let executor = MySqlExecutor::from_config(&local_config()).unwrap();
        let limits = ExecLimits { max_rows: 2, timeout: std::time::Duration::from_secs(5) };

        let result = executor
            .execute(
                "SELECT 1 AS n, CAST(2.50 AS DECIMAL(5,2)) AS d UNION ALL SELECT 2, 3 UNION ALL SELECT 3, 4",
                &limits,
            )
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["n", "d"]);
        assert_eq!(result.row_count(), 2);
        assert_eq!(result.rows[0]["d"], serde_json::json!(2.5));
    }

    #[tokio::test]
    #[ignore = "Requires running MySQL instance"]
    async fn test_describe_schema() {
        let executor = MySqlExecutor::from_config(&local_config()).unwrap();
        let summary = executor.describe_schema(&SchemaScope::default()).await.unwrap();
        assert!(summary.tables.iter().all(|t| !t.columns.is_empty()));
    }
}

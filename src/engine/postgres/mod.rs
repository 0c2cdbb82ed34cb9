//! `PostgreSQL` Executor
//!
//! Runs vetted statements inside a `READ ONLY` transaction.
//!
//! # Implementation Notes
//! - Uses `tokio-postgres` (native async driver, no TLS)
//! - One connection per call; the connection task is spawned on the runtime
//! - `statement_timeout` is set for the transaction and the call is also
//!   bounded with `tokio::time::timeout`
//! - Rows are pulled through a portal, so at most `max_rows` rows cross the wire
//! - `NUMERIC` is decoded from its binary form into a JSON number

use std::collections::BTreeMap;
use std::error::Error as StdError;

use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row};

use crate::dialect::SqlDialect;
use crate::engine::{
    execution_timeout, ColumnSummary, ConnectionConfig, DatabaseType, ExecLimits,
    ExecutionResult, QueryExecutor, SchemaScope, SchemaSummary, TableSummary,
};
use crate::error::{AskError, Result};

/// `PostgreSQL` executor for one database
#[derive(Debug, Clone)]
pub struct PostgresExecutor {
    config: Config,
}

impl PostgresExecutor {
    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        if config.engine != DatabaseType::Postgres {
            return Err(AskError::config_error(format!(
                "Expected PostgreSQL engine, got {}",
                config.engine
            )));
        }
        Ok(Self { config: build_pg_config(config)? })
    }

    async fn connect(&self) -> Result<Client> {
        let (client, connection) = self.config.connect(NoTls).await.map_err(|e| {
            AskError::execution_failed(format!("Failed to connect to PostgreSQL: {e}"))
        })?;

        // Connection errors are not logged to prevent credential leakage
        tokio::spawn(async move {
            let _ = connection.await;
        });

        Ok(client)
    }
}

impl QueryExecutor for PostgresExecutor {
    async fn execute(&self, sql: &str, limits: &ExecLimits) -> Result<ExecutionResult> {
        tokio::time::timeout(limits.timeout, async {
            let mut client = self.connect().await?;
            execute_query(&mut client, sql, limits).await
        })
        .await
        .map_err(|_| execution_timeout(limits.timeout))?
    }

    async fn describe_schema(&self, scope: &SchemaScope) -> Result<SchemaSummary> {
        let client = self.connect().await?;
        describe(&client, scope).await
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }
}

/// Build `PostgreSQL` connection config from `ConnectionConfig`
fn build_pg_config(config: &ConnectionConfig) -> Result<Config> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| AskError::config_error("PostgreSQL requires 'host' parameter"))?;

    let port = config
        .port
        .ok_or_else(|| AskError::config_error("PostgreSQL requires 'port' parameter"))?;

    let user = config
        .user
        .as_ref()
        .ok_or_else(|| AskError::config_error("PostgreSQL requires 'user' parameter"))?;

    let database = config
        .database
        .as_ref()
        .ok_or_else(|| AskError::config_error("PostgreSQL requires 'database' parameter"))?;

    let mut pg_config = Config::new();
    pg_config.host(host).port(port).user(user).dbname(database).application_name("askql");
    if let Some(password) = &config.password {
        pg_config.password(password);
    }

    Ok(pg_config)
}

async fn execute_query(
    client: &mut Client,
    query: &str,
    limits: &ExecLimits,
) -> Result<ExecutionResult> {
    let txn = client
        .build_transaction()
        .read_only(true)
        .start()
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to start transaction: {e}")))?;

    let timeout_ms = limits.timeout.as_millis().max(1);
    txn.batch_execute(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to set statement timeout: {e}")))?;

    let stmt = txn
        .prepare(query)
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to prepare query: {e}")))?;
    let column_names: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();

    // A portal row count of zero means "all rows"
    if limits.max_rows == 0 {
        return Ok(ExecutionResult::from_rows(column_names, Vec::new()));
    }

    let portal = txn
        .bind(&stmt, &[])
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to execute query: {e}")))?;
    let max_rows = i32::try_from(limits.max_rows).unwrap_or(i32::MAX);
    let rows = txn
        .query_portal(&portal, max_rows)
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to fetch rows: {e}")))?;

    let rows_data = rows.iter().map(row_to_json).collect::<Result<Vec<_>>>()?;

    // Read-only; nothing to keep
    let _ = txn.rollback().await;

    Ok(ExecutionResult::from_rows(column_names, rows_data))
}

async fn describe(client: &Client, scope: &SchemaScope) -> Result<SchemaSummary> {
    let query = "
        SELECT table_name::text, column_name::text, data_type::text
        FROM information_schema.columns
        WHERE table_schema = COALESCE($1, current_schema())
        ORDER BY table_name, ordinal_position";

    let rows = client.query(query, &[&scope.schema]).await.map_err(|e| {
        AskError::execution_failed(format!("Failed to query columns: {e}"))
    })?;

    let mut tables: BTreeMap<String, Vec<ColumnSummary>> = BTreeMap::new();
    for row in rows {
        let table: String = row.get(0);
        if !scope.includes(&table) {
            continue;
        }
        tables
            .entry(table)
            .or_default()
            .push(ColumnSummary { name: row.get(1), data_type: row.get(2) });
    }

    Ok(SchemaSummary {
        tables: tables.into_iter().map(|(name, columns)| TableSummary { name, columns }).collect(),
    })
}

/// Convert a `PostgreSQL` row to a JSON-safe `Vec`
fn row_to_json(row: &Row) -> Result<Vec<serde_json::Value>> {
    (0..row.len()).map(|idx| postgres_value_to_json(row, idx)).collect()
}

/// Read a nullable column value
fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        AskError::execution_failed(format!(
            "Failed to convert PostgreSQL type '{}' to JSON: {e}",
            row.columns()[idx].type_().name()
        ))
    })
}

fn float_to_json(v: f64) -> serde_json::Value {
    // NaN/Infinity have no JSON form
    serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

/// Convert `PostgreSQL` value to JSON value
fn postgres_value_to_json(row: &Row, idx: usize) -> Result<serde_json::Value> {
    use serde_json::Value;

    let col_type = row.columns()[idx].type_().clone();

    let value = match col_type {
        Type::BOOL => get::<bool>(row, idx)?.map(Value::Bool),

        Type::INT2 => get::<i16>(row, idx)?.map(Value::from),
        Type::INT4 => get::<i32>(row, idx)?.map(Value::from),
        Type::INT8 => get::<i64>(row, idx)?.map(Value::from),

        Type::FLOAT4 => get::<f32>(row, idx)?.map(|v| float_to_json(f64::from(v))),
        Type::FLOAT8 => get::<f64>(row, idx)?.map(float_to_json),
        Type::NUMERIC => get::<PgNumeric>(row, idx)?.map(|n| n.into_json()),

        Type::JSON | Type::JSONB => get::<Value>(row, idx)?,

        // BYTEA (binary data) - encode as Base64
        Type::BYTEA => get::<Vec<u8>>(row, idx)?.map(|v| {
            use base64::Engine;
            Value::String(base64::engine::general_purpose::STANDARD.encode(v))
        }),

        // Temporal types as ISO 8601 strings
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S").to_string())),
        Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, idx)?
            .map(|v| Value::String(v.to_rfc3339())),
        Type::DATE => get::<chrono::NaiveDate>(row, idx)?
            .map(|v| Value::String(v.format("%Y-%m-%d").to_string())),
        Type::TIME => get::<chrono::NaiveTime>(row, idx)?
            .map(|v| Value::String(v.format("%H:%M:%S").to_string())),

        Type::UUID => get::<uuid::Uuid>(row, idx)?.map(|v| Value::String(v.to_string())),

        // VARCHAR, TEXT, BPCHAR, NAME and any other text-compatible type
        _ => get::<String>(row, idx)?.map(Value::String),
    };

    Ok(value.unwrap_or(Value::Null))
}

/// `NUMERIC` in its decimal text form
#[derive(Debug, PartialEq)]
struct PgNumeric(String);

impl PgNumeric {
    fn into_json(self) -> serde_json::Value {
        match self.0.parse::<f64>() {
            Ok(v) if v.is_finite() => float_to_json(v),
            _ => serde_json::Value::String(self.0),
        }
    }
}

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        decode_numeric(raw).map(PgNumeric).ok_or_else(|| "invalid NUMERIC value".into())
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Decode the binary `NUMERIC` wire format
///
/// Header: digit count, weight (base-10000 exponent of the first digit),
/// sign, display scale; then the base-10000 digits.
fn decode_numeric(raw: &[u8]) -> Option<String> {
    let word = |at: usize| raw.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));

    let ndigits = usize::from(word(0)?);
    let weight = i64::from(word(2)? as i16);
    let sign = word(4)?;
    let dscale = usize::from(word(6)?);

    match sign {
        0x0000 | 0x4000 => {}
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => return None,
    }

    let digits = (0..ndigits).map(|i| word(8 + 2 * i)).collect::<Option<Vec<u16>>>()?;
    let digit_at = |pos: i64| usize::try_from(pos).ok().and_then(|p| digits.get(p)).copied().unwrap_or(0);

    let mut text = String::new();
    if sign == 0x4000 {
        text.push('-');
    }

    if weight < 0 {
        text.push('0');
    } else {
        for pos in 0..=weight {
            let d = digit_at(pos);
            if pos == 0 {
                text.push_str(&d.to_string());
            } else {
                text.push_str(&format!("{d:04}"));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let mut pos = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit_at(pos)));
            pos += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }

    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests marked #[ignore] need a running PostgreSQL instance:
    // cargo test --features postgres -- --ignored

    fn local_config() -> ConnectionConfig {
        ConnectionConfig::server(DatabaseType::Postgres, "localhost", 5432, "postgres", "postgres", "postgres")
    }

    fn numeric(ndigits: u16, weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        for word in [ndigits, weight as u16, sign, dscale].into_iter().chain(digits.iter().copied()) {
            raw.extend_from_slice(&word.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_missing_database_error() {
        let mut config = local_config();
        config.database = None;

        let err = build_pg_config(&config).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
        assert!(err.to_string().contains("'database'"));
    }

    #[test]
    fn test_password_is_optional() {
        let mut config = local_config();
        config.password = None;
        assert!(PostgresExecutor::from_config(&config).is_ok());
    }

    #[test]
    fn test_wrong_engine_rejected() {
        let mut config = local_config();
        config.engine = DatabaseType::MySQL;
        assert!(PostgresExecutor::from_config(&config).is_err());
    }

    #[test]
    fn test_decode_numeric() {
        // 12345.678
        assert_eq!(decode_numeric(&numeric(3, 1, 0, 3, &[1, 2345, 6780])).as_deref(), Some("12345.678"));
        // -0.05
        assert_eq!(decode_numeric(&numeric(1, -1, 0x4000, 2, &[500])).as_deref(), Some("-0.05"));
        // 0
        assert_eq!(decode_numeric(&numeric(0, 0, 0, 0, &[])).as_deref(), Some("0"));
        // 20000 with trailing zero groups omitted
        assert_eq!(decode_numeric(&numeric(1, 1, 0, 0, &[2])).as_deref(), Some("20000"));
        // NaN
        assert_eq!(decode_numeric(&numeric(0, 0, 0xC000, 0, &[])).as_deref(), Some("NaN"));
        // Truncated header
        assert_eq!(decode_numeric(&[0, 1]), None);
    }

    #[test]
    fn test_numeric_to_json() {
        assert_eq!(PgNumeric("12.50".into()).into_json(), serde_json::json!(12.5));
        assert_eq!(PgNumeric("NaN".into()).into_json(), serde_json::json!("NaN"));
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_execute_select_query() {
        let executor = PostgresExecutor::from_config(&local_config()).unwrap();
        let limits = ExecLimits { max_rows: 2, timeout: std::time::Duration::from_secs(5) };

        let result = executor
            .execute("SELECT g AS n, g::numeric / 4 AS q FROM generate_series(1, 10) g", &limits)
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["n", "q"]);
        assert_eq!(result.row_count(), 2);
        assert_eq!(result.rows[0]["n"], serde_json::json!(1));
        assert_eq!(result.rows[0]["q"], serde_json::json!(0.25));
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_transaction_is_read_only() {
        let executor = PostgresExecutor::from_config(&local_config()).unwrap();
        let limits = ExecLimits { max_rows: 10, timeout: std::time::Duration::from_secs(5) };

        let err = executor
            .execute("SELECT * FROM (SELECT 1) t FOR UPDATE", &limits)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "EXECUTION_FAILED");
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_statement_timeout() {
        let executor = PostgresExecutor::from_config(&local_config()).unwrap();
        let limits = ExecLimits { max_rows: 10, timeout: std::time::Duration::from_millis(200) };

        let err = executor.execute("SELECT pg_sleep(5)", &limits).await.unwrap_err();
        assert_eq!(err.error_code(), "EXECUTION_FAILED");
    }
}

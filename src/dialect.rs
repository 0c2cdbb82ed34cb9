//! SQL Dialects
//!
//! The dialect decides how result size is bounded (`TOP n` versus `LIMIT n`) and
//! renders the handful of dialect-specific fragments that pattern and preset
//! templates need. Nothing here parses SQL.

use serde::{Deserialize, Serialize};

/// Target SQL dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    /// Microsoft SQL Server (T-SQL)
    #[serde(alias = "mssql", alias = "tsql")]
    SqlServer,
    /// `PostgreSQL`
    Postgres,
    /// `MySQL` / `MariaDB`
    MySql,
    /// `SQLite`
    Sqlite,
}

/// How a row cap is expressed in a dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowCapStyle {
    /// `SELECT TOP n ...`
    Top,
    /// `... LIMIT n`
    Limit,
}

impl SqlDialect {
    /// Get the dialect name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SqlServer => "sqlserver",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }

    /// Human-readable name used in prompts
    #[must_use]
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::SqlServer => "SQL Server (T-SQL)",
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::Sqlite => "SQLite",
        }
    }

    /// Row cap form for this dialect
    #[must_use]
    pub const fn row_cap_style(&self) -> RowCapStyle {
        match self {
            Self::SqlServer => RowCapStyle::Top,
            Self::Postgres | Self::MySql | Self::Sqlite => RowCapStyle::Limit,
        }
    }

    /// Quote an identifier
    #[must_use]
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Self::SqlServer => format!("[{}]", ident.replace(']', "]]")),
            Self::MySql => format!("`{}`", ident.replace('`', "``")),
            Self::Postgres | Self::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Year-month bucket (`yyyy-MM`) of a date expression
    #[must_use]
    pub fn month_key(&self, expr: &str) -> String {
        match self {
            Self::SqlServer => format!("FORMAT({expr},'yyyy-MM')"),
            Self::Postgres => format!("to_char({expr},'YYYY-MM')"),
            Self::MySql => format!("DATE_FORMAT({expr},'%Y-%m')"),
            Self::Sqlite => format!("strftime('%Y-%m',{expr})"),
        }
    }

    /// Date `days` days before now
    #[must_use]
    pub fn days_ago(&self, days: u32) -> String {
        match self {
            Self::SqlServer => format!("DATEADD(day,-{days},GETDATE())"),
            Self::Postgres => format!("(CURRENT_DATE - INTERVAL '{days} days')"),
            Self::MySql => format!("DATE_SUB(CURDATE(), INTERVAL {days} DAY)"),
            Self::Sqlite => format!("date('now','-{days} days')"),
        }
    }
}

impl std::fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//! Draft self-checks
//!
//! The local check binds the aliases introduced after `FROM`/`JOIN` and makes
//! sure every column reference names a column of the schema summary. It only
//! runs when column information is known, and it stays silent wherever it
//! cannot tell (derived tables, CTEs, table functions).
//!
//! The model check is a single verification call answered with
//! `VERDICT: OK` or `VERDICT: FIX <reason>`.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::dialect::SqlDialect;
use crate::engine::{SchemaSummary, TableSummary};
use crate::guard::lexer::{tokenize, Token, TokenKind};

static VERDICT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[ \t>*`]*VERDICT[ \t]*:[ \t]*(OK|FIX)\b[ \t:-]*(.*)$").expect("valid regex")
});

/// Names suggested for a misspelled column must be at least this similar
const SUGGESTION_THRESHOLD: f64 = 0.8;

/// Words that are never column references
const KEYWORDS: &[&str] = &[
    "ALL", "AND", "ANY", "APPLY", "AS", "ASC", "BETWEEN", "BIGINT", "BY", "CASE", "CHAR", "COLLATE",
    "CROSS", "CURRENT", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "DATE", "DATETIME",
    "DAY", "DAYOFYEAR", "DAYS", "DD", "DW", "DY", "DECIMAL", "DESC", "DISTINCT", "ELSE", "END", "ESCAPE", "EXCEPT", "EXISTS",
    "FALSE", "FETCH", "FILTER", "FIRST", "FLOAT", "FOLLOWING", "FROM", "FULL", "GROUP", "HAVING",
    "HH", "HOUR", "ILIKE", "IN", "INNER", "INT", "INTEGER", "INTERSECT", "INTERVAL", "IS", "JOIN",
    "LAST", "LATERAL", "LEFT", "LIKE", "LIMIT", "MI", "MINUTE", "MM", "MONTH", "MONTHS", "NEXT",
    "NOT", "NULL", "NULLS", "NUMERIC", "NVARCHAR", "OFFSET", "ON", "ONLY", "OR", "ORDER", "OUTER",
    "OVER", "PARTITION", "PERCENT", "PRECEDING", "QQ", "QUARTER", "RANGE", "REAL", "RECURSIVE",
    "RIGHT", "ROW", "ROWS", "SECOND", "SELECT", "SOME", "SS", "TEXT", "THEN", "TIES", "TIME",
    "TIMESTAMP", "TOP", "TRUE", "UNBOUNDED", "UNION", "USING", "VALUES", "VARCHAR", "WEEK", "WEEKS",
    "WEEKDAY", "WHEN", "WHERE", "WINDOW", "WITH", "WITHIN", "WK", "WW", "YEAR", "YEARS", "YY", "YYYY",
];

/// Functions whose first argument is a date part, not a column
const DATE_PART_FUNCTIONS: &[&str] =
    &["DATEADD", "DATEDIFF", "DATEDIFF_BIG", "DATENAME", "DATEPART", "DATETRUNC", "DATE_PART", "DATE_TRUNC"];

fn is_keyword(token: &Token<'_>) -> bool {
    token.kind == TokenKind::Word && KEYWORDS.iter().any(|k| token.text.eq_ignore_ascii_case(k))
}

/// Identifier that could name a table, alias or column
fn ident(token: &Token<'_>) -> Option<String> {
    match token.kind {
        TokenKind::Word if token.text.starts_with(['@', '#']) || is_keyword(token) => None,
        TokenKind::Word | TokenKind::QuotedIdent => token.ident_name(),
        _ => None,
    }
}

fn ends_expression(token: &Token<'_>) -> bool {
    match token.kind {
        TokenKind::Punct => token.is_punct(')'),
        TokenKind::Number | TokenKind::StringLit | TokenKind::QuotedIdent => true,
        TokenKind::Word => token.is_word("END") || ident(token).is_some(),
        _ => false,
    }
}

/// Whether the name at `i` is an implicit alias (`SUM(x) total`, `p.Name label`)
///
/// The row count of `TOP 5` or `TOP (5)` does not end an expression.
fn is_implicit_alias(tokens: &[Token<'_>], i: usize) -> bool {
    let back = |n: usize| i.checked_sub(n).and_then(|at| tokens.get(at));
    let Some(prev) = back(1) else {
        return false;
    };
    let after_top = (prev.kind == TokenKind::Number && back(2).is_some_and(|t| t.is_word("TOP")))
        || (prev.is_punct(')')
            && back(2).is_some_and(|t| t.kind == TokenKind::Number)
            && back(3).is_some_and(|t| t.is_punct('('))
            && back(4).is_some_and(|t| t.is_word("TOP")));
    ends_expression(prev)
        && !after_top
        && !tokens.get(i + 1).is_some_and(|t| t.is_punct('(') || t.is_punct('.'))
}

/// Closest known name, if any is similar enough
fn closest<'c>(name: &str, candidates: impl Iterator<Item = &'c str>) -> Option<&'c str> {
    let name = name.to_lowercase();
    candidates
        .map(|c| (c, strsim::jaro_winkler(&name, &c.to_lowercase())))
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(c, _)| c)
}

fn with_hint(message: String, hint: Option<&str>) -> String {
    match hint {
        Some(hint) => format!("{message} (did you mean {hint}?)"),
        None => message,
    }
}

/// What an alias or table name in scope refers to
#[derive(Debug, Clone, Copy)]
enum Source<'s> {
    Table(&'s TableSummary),
    /// CTE, derived table or function: columns unknown
    Opaque,
}

struct Scope<'s> {
    summary: &'s SchemaSummary,
    /// Lowercased alias or table name
    sources: HashMap<String, Source<'s>>,
    /// CTE names and `AS` aliases, lowercased
    defined: HashSet<String>,
    issues: Vec<String>,
}

impl<'s> Scope<'s> {
    fn new(summary: &'s SchemaSummary) -> Self {
        Self { summary, sources: HashMap::new(), defined: HashSet::new(), issues: Vec::new() }
    }

    fn issue(&mut self, message: String) {
        if !self.issues.contains(&message) {
            self.issues.push(message);
        }
    }

    fn collect_definitions(&mut self, tokens: &[Token<'_>]) {
        for (i, token) in tokens.iter().enumerate() {
            // `name AS (` introduces a CTE, `AS name` an output or table alias
            if token.is_word("AS") {
                if let Some(name) = tokens.get(i + 1).and_then(ident) {
                    self.defined.insert(name.to_lowercase());
                }
            } else if let Some(name) = ident(token) {
                if is_implicit_alias(tokens, i) {
                    self.defined.insert(name.to_lowercase());
                    continue;
                }
                // `name (cols) AS (` as well
                let mut after = i + 1;
                if tokens.get(after).is_some_and(|t| t.is_punct('(')) {
                    let depth = tokens[after].depth;
                    after = tokens[after + 1..]
                        .iter()
                        .position(|t| t.is_punct(')') && t.depth == depth)
                        .map_or(tokens.len(), |p| after + 2 + p);
                }
                let is_cte = tokens.get(after).is_some_and(|t| t.is_word("AS"))
                    && tokens.get(after + 1).is_some_and(|t| t.is_punct('('));
                if is_cte {
                    self.defined.insert(name.to_lowercase());
                }
            }
        }
    }

    fn bind_sources(&mut self, tokens: &[Token<'_>]) {
        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];
            let opens_list = token.is_word("JOIN") || (token.is_word("FROM") && in_select(tokens, i));
            if !opens_list {
                i += 1;
                continue;
            }

            let mut next = self.bind_ref(tokens, i + 1);
            while tokens.get(next).is_some_and(|t| t.is_punct(',') && t.depth == token.depth) {
                next = self.bind_ref(tokens, next + 1);
            }
            // Derived tables hold their own FROM lists
            i += 1;
        }
    }

    /// Bind one table reference starting at `start`; returns the index after it
    fn bind_ref(&mut self, tokens: &[Token<'_>], start: usize) -> usize {
        let Some(first) = tokens.get(start) else {
            return start;
        };

        let (mut i, source, table) = if first.is_punct('(') {
            let close = tokens[start + 1..]
                .iter()
                .position(|t| t.is_punct(')') && t.depth == first.depth)
                .map_or(tokens.len(), |p| start + 1 + p);
            (close + 1, Source::Opaque, None)
        } else if let Some(mut name) = ident(first) {
            let mut i = start + 1;
            while tokens.get(i).is_some_and(|t| t.is_punct('.')) {
                match tokens.get(i + 1).and_then(ident) {
                    Some(part) => name = part,
                    None => break,
                }
                i += 2;
            }

            let source = if tokens.get(i).is_some_and(|t| t.is_punct('(')) {
                let depth = tokens[i].depth;
                i = tokens[i + 1..]
                    .iter()
                    .position(|t| t.is_punct(')') && t.depth == depth)
                    .map_or(tokens.len(), |p| i + 2 + p);
                Source::Opaque
            } else if self.defined.contains(&name.to_lowercase()) {
                Source::Opaque
            } else if let Some(table) = self.summary.table(&name) {
                Source::Table(table)
            } else {
                let hint = closest(&name, self.summary.tables.iter().map(|t| t.name.as_str()));
                self.issue(with_hint(format!("unknown table {name}"), hint));
                Source::Opaque
            };
            (i, source, Some(name))
        } else {
            return start + 1;
        };

        if let Some(table) = table {
            self.sources.insert(table.to_lowercase(), source);
        }

        if tokens.get(i).is_some_and(|t| t.is_word("AS")) {
            i += 1;
        }
        if let Some(alias) = tokens.get(i).and_then(ident) {
            self.sources.insert(alias.to_lowercase(), source);
            i += 1;
        }
        i
    }

    fn check_columns(&mut self, tokens: &[Token<'_>]) {
        let all_tables = !self.sources.is_empty()
            && self.sources.values().all(|s| matches!(s, Source::Table(_)));

        for (i, token) in tokens.iter().enumerate() {
            let Some(name) = ident(token) else {
                continue;
            };
            let prev = i.checked_sub(1).and_then(|p| tokens.get(p));
            let next = tokens.get(i + 1);
            if prev.is_some_and(|p| p.is_punct('.') || p.is_punct(':') || p.is_word("AS"))
                || next.is_some_and(|n| n.is_punct('('))
            {
                continue;
            }
            let date_part = prev.is_some_and(|p| p.is_punct('('))
                && i.checked_sub(2)
                    .and_then(|f| tokens.get(f))
                    .is_some_and(|f| DATE_PART_FUNCTIONS.iter().any(|k| f.is_word(k)));
            if date_part {
                continue;
            }

            if next.is_some_and(|n| n.is_punct('.')) {
                let column = tokens.get(i + 2).and_then(Token::ident_name);
                let dotted_on = tokens.get(i + 3).is_some_and(|t| t.is_punct('.') || t.is_punct('('));
                if let (Some(column), false) = (column, dotted_on) {
                    self.check_qualified(&name, &column);
                }
                continue;
            }

            let lower = name.to_lowercase();
            if all_tables && !self.sources.contains_key(&lower) && !self.defined.contains(&lower) {
                self.check_bare(&name);
            }
        }
    }

    fn check_qualified(&mut self, qualifier: &str, column: &str) {
        let Some(Source::Table(table)) = self.sources.get(&qualifier.to_lowercase()).copied() else {
            return;
        };
        if table.columns.is_empty() || table.columns.iter().any(|c| c.name.eq_ignore_ascii_case(column)) {
            return;
        }
        let hint = closest(column, table.columns.iter().map(|c| c.name.as_str()))
            .map(|c| format!("{qualifier}.{c}"));
        self.issue(with_hint(format!("unknown column {qualifier}.{column}"), hint.as_deref()));
    }

    fn check_bare(&mut self, column: &str) {
        let tables: Vec<&TableSummary> = self
            .sources
            .values()
            .filter_map(|s| match s {
                Source::Table(t) => Some(*t),
                Source::Opaque => None,
            })
            .collect();
        if tables.iter().any(|t| t.columns.is_empty()) {
            return;
        }

        let known = tables.iter().flat_map(|t| t.columns.iter());
        if known.clone().any(|c| c.name.eq_ignore_ascii_case(column)) {
            return;
        }
        let hint = closest(column, tables.iter().copied().flat_map(|t| t.columns.iter().map(|c| c.name.as_str())));
        self.issue(with_hint(format!("unknown column {column}"), hint));
    }
}

/// Whether the `FROM` at `at` belongs to a SELECT at its own depth (not `EXTRACT(x FROM y)`)
fn in_select(tokens: &[Token<'_>], at: usize) -> bool {
    let depth = tokens[at].depth;
    for token in tokens[..at].iter().rev() {
        if token.depth < depth {
            return false;
        }
        if token.depth == depth && token.is_word("SELECT") {
            return true;
        }
    }
    false
}

/// Problems a draft has against the known schema; empty when it looks fine
#[must_use]
pub fn schema_issues(sql: &str, summary: &SchemaSummary, dialect: SqlDialect) -> Vec<String> {
    if !summary.has_columns() {
        return Vec::new();
    }
    let Ok(tokens) = tokenize(sql, dialect) else {
        return Vec::new();
    };
    let tokens: Vec<Token<'_>> = tokens.into_iter().filter(Token::is_significant).collect();

    let mut scope = Scope::new(summary);
    scope.collect_definitions(&tokens);
    scope.bind_sources(&tokens);
    scope.check_columns(&tokens);
    scope.issues
}

/// Model verification answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Fix(String),
    /// No `VERDICT:` line
    Malformed,
}

impl Verdict {
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let Some(caps) = VERDICT.captures(text) else {
            return Self::Malformed;
        };
        if caps[1].eq_ignore_ascii_case("OK") {
            return Self::Ok;
        }
        let reason = caps.get(2).map_or("", |m| m.as_str()).trim().trim_end_matches('`');
        if reason.is_empty() {
            Self::Fix("the reviewer asked for a correction".to_string())
        } else {
            Self::Fix(reason.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ColumnSummary;
    use pretty_assertions::assert_eq;

    fn shop() -> SchemaSummary {
        let table = |name: &str, columns: &[&str]| TableSummary {
            name: name.into(),
            columns: columns
                .iter()
                .map(|c| ColumnSummary { name: (*c).into(), data_type: "int".into() })
                .collect(),
        };
        SchemaSummary {
            tables: vec![
                table("products", &["ProductCode", "ProductName", "Quantity"]),
                table("selling", &["ProductCode", "QuantitySold", "SellingPrice", "Date"]),
            ],
        }
    }

    fn issues(sql: &str) -> Vec<String> {
        schema_issues(sql, &shop(), SqlDialect::SqlServer)
    }

    #[test]
    fn test_known_columns_pass() {
        assert!(issues(
            "SELECT TOP 10 p.ProductName, SUM(s.QuantitySold * s.SellingPrice) AS Revenue \
             FROM dbo.selling AS s JOIN dbo.products p ON s.ProductCode = p.ProductCode \
             GROUP BY p.ProductName ORDER BY Revenue DESC"
        )
        .is_empty());
        assert!(issues("SELECT TOP 5 ProductName, Quantity FROM products WHERE Quantity <= 5").is_empty());
        assert!(issues("SELECT [p].[ProductName] FROM [dbo].[products] AS [p]").is_empty());
    }

    #[test]
    fn test_unknown_qualified_column_gets_suggestion() {
        assert_eq!(
            issues("SELECT s.QtySold FROM selling s"),
            vec!["unknown column s.QtySold (did you mean s.QuantitySold?)".to_string()]
        );
    }

    #[test]
    fn test_unknown_bare_column_and_table() {
        assert_eq!(issues("SELECT Price FROM products"), vec!["unknown column Price".to_string()]);
        assert_eq!(
            issues("SELECT x FROM product"),
            vec!["unknown table product (did you mean products?)".to_string()]
        );
    }

    #[test]
    fn test_opaque_sources_are_not_checked() {
        assert!(issues(
            "WITH t AS (SELECT ProductCode, SUM(QuantitySold) AS n FROM selling GROUP BY ProductCode) \
             SELECT TOP 5 t.ProductCode, t.n FROM t ORDER BY n DESC"
        )
        .is_empty());
        assert!(issues("SELECT d.total FROM (SELECT COUNT(*) AS total FROM products) AS d").is_empty());
    }

    #[test]
    fn test_function_arguments_are_not_tables() {
        assert!(schema_issues(
            "SELECT EXTRACT(YEAR FROM s.Date) AS y FROM selling AS s",
            &shop(),
            SqlDialect::Postgres
        )
        .is_empty());
        assert!(issues("SELECT ProductCode FROM selling WHERE Date >= DATEADD(day, -90, GETDATE())").is_empty());
    }

    #[test]
    fn test_implicit_aliases_are_not_columns() {
        assert!(issues(
            "SELECT TOP 10 p.ProductName name, SUM(s.QuantitySold * s.SellingPrice) total \
             FROM selling s JOIN products p ON p.ProductCode = s.ProductCode \
             GROUP BY p.ProductName ORDER BY total DESC"
        )
        .is_empty());
        assert!(issues("SELECT Quantity qty, 1 one, 'x' label FROM products").is_empty());
        assert!(issues("SELECT CASE WHEN Quantity > 5 THEN 1 ELSE 0 END in_stock FROM products").is_empty());
    }

    #[test]
    fn test_date_parts_are_not_columns() {
        assert!(issues(
            "SELECT DATEPART(dw, Date) AS d, DATEPART(qq, Date) AS q, DATEPART(m, Date) AS m \
             FROM selling WHERE Date >= DATEADD(yyyy, -1, GETDATE())"
        )
        .is_empty());
    }

    #[test]
    fn test_typo_after_keyword_still_flagged() {
        assert_eq!(
            issues("SELECT ProductName FROM products WHERE Quantiy > 5"),
            vec!["unknown column Quantiy (did you mean Quantity?)".to_string()]
        );
        assert_eq!(issues("SELECT TOP 5 Price FROM products"), vec!["unknown column Price".to_string()]);
        assert_eq!(issues("SELECT TOP (5) Price FROM products"), vec!["unknown column Price".to_string()]);
    }

    #[test]
    fn test_names_only_summary_skips_check() {
        let summary = SchemaSummary::from_names(["products"]);
        assert!(schema_issues("SELECT nope FROM products", &summary, SqlDialect::Sqlite).is_empty());
    }

    #[test]
    fn test_verdict_parsing() {
        assert_eq!(Verdict::parse("VERDICT: OK"), Verdict::Ok);
        assert_eq!(Verdict::parse("Looks right.\nverdict: ok\n"), Verdict::Ok);
        assert_eq!(
            Verdict::parse("VERDICT: FIX missing GROUP BY on p.ProductName"),
            Verdict::Fix("missing GROUP BY on p.ProductName".into())
        );
        assert_eq!(
            Verdict::parse("VERDICT: FIX"),
            Verdict::Fix("the reviewer asked for a correction".into())
        );
        assert_eq!(Verdict::parse("The SQL looks fine to me."), Verdict::Malformed);
        assert_eq!(Verdict::parse("VERDICT: MAYBE"), Verdict::Malformed);
    }
}

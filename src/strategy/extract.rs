//! SQL extraction from model completions
//!
//! Models wrap their answer in tags, code fences or prose despite being told
//! not to. Candidate regions are tried in order:
//!
//! 1. `<SQL> ... </SQL>` (the closing tag may be missing: it is the stop sequence)
//! 2. a ```` ```sql ```` fence
//! 3. any fence
//! 4. a `SQLQuery:` / `SQL:` label
//! 5. the whole completion
//!
//! Within the first region that has one, the statement runs from the first
//! statement-shaped `SELECT`/`WITH` to the first terminator outside literals
//! (or, outside tags and fences, to the first blank line). Dangling tails
//! (`WHERE`, `AND`, `OR`, `ON`, `JOIN`, `GROUP BY`, `ORDER BY`) left by a
//! truncated completion are dropped. A "select" in prose ("I will select the
//! best products") is skipped: a run of three plain words is not SQL.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::dialect::SqlDialect;
use crate::error::{AskError, Result};
use crate::guard::has_stray_select;
use crate::guard::lexer::{tokenize_partial, Token, TokenKind};

static SQL_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<sql>\s*(.*?)\s*(?:</sql>|$)").expect("valid regex"));

static SQL_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```\s*sql\b\s*(.*?)(?:```|$)").expect("valid regex"));

static ANY_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*\s*(.*?)(?:```|$)").expect("valid regex"));

static SQL_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\b(?:SQLQuery|SQL)\s*:\s*(.*)").expect("valid regex"));

static STATEMENT_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bselect\b|\bwith\s+(?:recursive\s+)?[^\s(]+\s*(?:\([^)]*\)\s*)?as\s*\(")
        .expect("valid regex")
});

static BLANK_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*\r?\n").expect("valid regex"));

/// Keywords that may stand next to each other in a statement
const SQL_WORDS: &[&str] = &[
    "ALL", "AND", "APPLY", "AS", "ASC", "AT", "BETWEEN", "BY", "CASE", "CAST", "COLLATE", "CROSS",
    "DESC", "DISTINCT", "ELSE", "END", "ESCAPE", "EXCEPT", "EXISTS", "FALSE", "FETCH", "FILTER",
    "FIRST", "FROM", "FULL", "GROUP", "HAVING", "IN", "INNER", "INTERSECT", "INTERVAL", "IS",
    "JOIN", "LAST", "LEFT", "LIKE", "LIMIT", "NATURAL", "NEXT", "NOT", "NULL", "NULLS", "OFFSET",
    "ON", "ONLY", "OR", "ORDER", "OUTER", "OVER", "PARTITION", "PERCENT", "RECURSIVE", "RIGHT",
    "ROW", "ROWS", "SELECT", "THEN", "TIES", "TIME", "TOP", "TRUE", "UNION", "USING", "WHEN",
    "WHERE", "WINDOW", "WITH", "WITHIN", "WITHOUT", "ZONE",
];

/// Words a truncated completion may end on
const DANGLING: &[&str] = &["WHERE", "AND", "OR", "ON", "JOIN"];
const JOIN_MODIFIERS: &[&str] = &["INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS"];

/// Pull one statement out of a completion
///
/// Fails with `Extraction` when no region holds a statement, or when the
/// statement ends inside an unterminated literal or comment.
pub fn extract_sql(completion: &str, dialect: SqlDialect) -> Result<String> {
    let delimited = [&*SQL_TAG, &*SQL_FENCE, &*ANY_FENCE]
        .into_iter()
        .filter_map(|rx| rx.captures(completion).and_then(|c| c.get(1)).map(|m| (m.as_str(), true)));
    let free = SQL_LABEL
        .captures(completion)
        .and_then(|c| c.get(1))
        .map(|m| (m.as_str(), false))
        .into_iter()
        .chain(std::iter::once((completion, false)));

    for (region, fenced) in delimited.chain(free) {
        if let Some(statement) = statement_in(region, fenced, dialect)? {
            tracing::debug!(sql = %statement, "extracted statement from completion");
            return Ok(statement);
        }
    }

    Err(AskError::extraction("no SELECT or WITH statement in completion"))
}

/// First statement-shaped span in `region`
///
/// A span that ends inside a literal is an error only when no later span
/// in the region is a statement.
fn statement_in(region: &str, fenced: bool, dialect: SqlDialect) -> Result<Option<String>> {
    let mut failure = None;
    for found in STATEMENT_START.find_iter(region) {
        match candidate(&region[found.start()..], fenced, dialect) {
            Ok(Some(statement)) => return Ok(Some(statement)),
            Ok(None) => {}
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }
    failure.map_or(Ok(None), Err)
}

fn candidate(mut span: &str, fenced: bool, dialect: SqlDialect) -> Result<Option<String>> {
    // Closing fence or tag left in free text
    if let Some(cut) = ["```", "</"].iter().filter_map(|marker| span.find(marker)).min() {
        span = &span[..cut];
    }
    if !fenced {
        if let Some(blank) = BLANK_LINE.find(span) {
            span = &span[..blank.start()];
        }
    }

    let tokens = tokenize_partial(span, dialect);
    let lexed = tokens.last().map_or(0, Token::end);
    let terminator = tokens.iter().position(|t| t.kind == TokenKind::Semicolon);

    let tokens = match terminator {
        Some(at) => &tokens[..at],
        None => &tokens[..],
    };

    let mut significant: Vec<&Token<'_>> = tokens.iter().filter(|t| t.is_significant()).collect();
    if reads_as_prose(&significant) || has_stray_select(significant.iter().copied()) {
        return Ok(None);
    }
    if terminator.is_none() && lexed < span.len() {
        return Err(AskError::extraction("completion ends inside a literal or comment"));
    }
    trim_dangling(&mut significant);

    // A bare keyword is not a statement
    if significant.len() < 2 {
        return Ok(None);
    }

    let end = significant.last().map_or(0, |t| t.end());
    Ok(Some(span[..end].trim().to_string()))
}

/// Three plain words in a row never occur in a statement
fn reads_as_prose(tokens: &[&Token<'_>]) -> bool {
    let mut run = 0;
    for token in tokens {
        let plain = token.kind == TokenKind::Word && !SQL_WORDS.iter().any(|k| token.is_word(k));
        run = if plain { run + 1 } else { 0 };
        if run == 3 {
            return true;
        }
    }
    false
}

fn trim_dangling(tokens: &mut Vec<&Token<'_>>) {
    while let Some(last) = tokens.last() {
        if last.is_punct(',') || DANGLING.iter().any(|k| last.is_word(k)) {
            let was_join = last.is_word("JOIN");
            tokens.pop();
            if was_join {
                while tokens.last().is_some_and(|t| JOIN_MODIFIERS.iter().any(|k| t.is_word(k))) {
                    tokens.pop();
                }
            }
        } else if last.is_word("BY")
            && tokens.len() >= 2
            && (tokens[tokens.len() - 2].is_word("GROUP") || tokens[tokens.len() - 2].is_word("ORDER"))
        {
            tokens.truncate(tokens.len() - 2);
        } else {
            break;
        }
    }
}

//! Read-Only Safety Guard
//!
//! Every statement that reaches a database passes through [`SafetyGuard::evaluate`],
//! whatever produced it: a pattern template, a model completion, a preset or a
//! human. The guard either rejects the statement with a [`RejectReason`] or
//! returns it rewritten so that it is bounded by a row cap.
//!
//! # Validation Strategy
//! - Tokenize first (see [`lexer`]) so that literals, quoted identifiers and
//!   comments can never trip a keyword check
//! - Exactly one statement, beginning with `SELECT` or `WITH`
//! - Mutating and privileged keywords rejected as whole words only
//! - Optional object policy: system catalogs, cross-database names and
//!   schemas outside an allow-list
//! - Row cap enforced in the dialect's own form (`TOP n` or `LIMIT n`), an
//!   existing literal cap clamped to the configured maximum
//!
//! Rewriting is idempotent: feeding accepted output back in returns it unchanged.

pub mod lexer;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dialect::{RowCapStyle, SqlDialect};
use crate::i18n::Language;
use lexer::{Token, TokenKind};

/// Keywords that make a statement something other than a plain read
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "DROP", "ALTER", "CREATE", "TRUNCATE", "EXEC",
    "EXECUTE", "GRANT", "REVOKE",
];

/// Qualifiers that address system catalogs
const SYSTEM_SCHEMAS: &[&str] =
    &["sys", "information_schema", "pg_catalog", "performance_schema", "mysql"];

/// Individual system objects and row-set functions
const SYSTEM_OBJECTS: &[&str] = &[
    "sqlite_master",
    "sqlite_schema",
    "sqlite_temp_master",
    "openrowset",
    "openquery",
    "opendatasource",
    "openxml",
];

/// Name prefixes of system procedures and functions
const SYSTEM_PREFIXES: &[&str] = &["sp_", "xp_", "pg_"];

/// Operators joining the branches of a compound statement
const SET_OPERATORS: &[&str] = &["UNION", "INTERSECT", "EXCEPT", "MINUS"];

/// Keywords that end a `FROM` list at the same depth
const FROM_TERMINATORS: &[&str] = &[
    "WHERE", "GROUP", "HAVING", "ORDER", "UNION", "EXCEPT", "INTERSECT", "LIMIT", "OFFSET",
    "FETCH", "WINDOW", "ON", "USING", "FOR",
];

/// Object-level restrictions; an empty allow-list disables them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPolicy {
    /// Schemas a two-part table name may use
    #[serde(default)]
    pub allowed_schemas: Vec<String>,
}

impl ObjectPolicy {
    /// Policy allowing the given schemas
    pub fn allow_schemas<I, S>(schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { allowed_schemas: schemas.into_iter().map(Into::into).collect() }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.allowed_schemas.is_empty()
    }

    fn allows(&self, schema: &str) -> bool {
        self.allowed_schemas.iter().any(|s| s.eq_ignore_ascii_case(schema))
    }
}

/// Everything the guard needs to judge a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardPolicy {
    pub dialect: SqlDialect,
    /// Cap inserted when the statement has none
    pub preview_limit: u64,
    /// Ceiling an existing cap is clamped to
    pub max_rows: u64,
    pub objects: ObjectPolicy,
}

impl GuardPolicy {
    /// Policy without object restrictions; the preview limit never exceeds `max_rows`
    #[must_use]
    pub fn new(dialect: SqlDialect, preview_limit: u64, max_rows: u64) -> Self {
        let max_rows = max_rows.max(1);
        Self {
            dialect,
            preview_limit: preview_limit.clamp(1, max_rows),
            max_rows,
            objects: ObjectPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_objects(mut self, objects: ObjectPolicy) -> Self {
        self.objects = objects;
        self
    }
}

/// Why a statement was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Nothing but whitespace, comments or terminators
    Empty,
    /// Unterminated literal or comment, or unbalanced parentheses
    Malformed,
    /// More than one statement
    MultipleStatements,
    /// Does not begin with `SELECT` or `WITH`
    NotReadOnly,
    /// Contains a mutating or privileged keyword
    ForbiddenKeyword(String),
    /// `SELECT ... INTO` creates a table
    SelectInto,
    /// References a system catalog, procedure or row-set function
    SystemObject(String),
    /// References another database
    CrossDatabase(String),
    /// Uses a schema outside the allow-list
    SchemaNotAllowed(String),
    /// Has a row cap the guard cannot read as a literal
    UnverifiableRowCap,
}

impl RejectReason {
    /// Stable code for programmatic handling
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Empty => "EMPTY",
            Self::Malformed => "MALFORMED",
            Self::MultipleStatements => "MULTIPLE_STATEMENTS",
            Self::NotReadOnly => "NOT_READ_ONLY",
            Self::ForbiddenKeyword(_) => "FORBIDDEN_KEYWORD",
            Self::SelectInto => "SELECT_INTO",
            Self::SystemObject(_) => "SYSTEM_OBJECT",
            Self::CrossDatabase(_) => "CROSS_DATABASE",
            Self::SchemaNotAllowed(_) => "SCHEMA_NOT_ALLOWED",
            Self::UnverifiableRowCap => "UNVERIFIABLE_ROW_CAP",
        }
    }

    /// Localized explanation, safe to show to the caller
    #[must_use]
    pub fn describe(&self, lang: Language) -> String {
        match (self, lang) {
            (Self::Empty, Language::Ar) => "الاستعلام فارغ".to_string(),
            (Self::Empty, Language::En) => "the query is empty".to_string(),
            (Self::Malformed, Language::Ar) => {
                "تعذّر تحليل الاستعلام (نص أو تعليق أو قوس غير مغلق)".to_string()
            }
            (Self::Malformed, Language::En) => {
                "the query could not be parsed (unclosed quote, comment or parenthesis)".to_string()
            }
            (Self::MultipleStatements, Language::Ar) => "يُسمح بعبارة واحدة فقط".to_string(),
            (Self::MultipleStatements, Language::En) => {
                "only a single statement is allowed".to_string()
            }
            (Self::NotReadOnly, Language::Ar) => "يُسمح باستعلامات SELECT فقط".to_string(),
            (Self::NotReadOnly, Language::En) => "only SELECT queries are allowed".to_string(),
            (Self::ForbiddenKeyword(k), Language::Ar) => {
                format!("الكلمة المفتاحية {k} غير مسموح بها")
            }
            (Self::ForbiddenKeyword(k), Language::En) => format!("the keyword {k} is not allowed"),
            (Self::SelectInto, Language::Ar) => "استخدام SELECT ... INTO غير مسموح به".to_string(),
            (Self::SelectInto, Language::En) => "SELECT ... INTO is not allowed".to_string(),
            (Self::SystemObject(o), Language::Ar) => {
                format!("الوصول إلى كائن النظام {o} غير مسموح به")
            }
            (Self::SystemObject(o), Language::En) => {
                format!("access to the system object {o} is not allowed")
            }
            (Self::CrossDatabase(o), Language::Ar) => {
                format!("الإشارة إلى قاعدة بيانات أخرى ({o}) غير مسموح بها")
            }
            (Self::CrossDatabase(o), Language::En) => {
                format!("the cross-database reference {o} is not allowed")
            }
            (Self::SchemaNotAllowed(s), Language::Ar) => {
                format!("المخطط {s} ليس ضمن المخططات المسموح بها")
            }
            (Self::SchemaNotAllowed(s), Language::En) => {
                format!("the schema {s} is not in the allowed list")
            }
            (Self::UnverifiableRowCap, Language::Ar) => {
                "يجب أن يكون حد الصفوف رقمًا صريحًا".to_string()
            }
            (Self::UnverifiableRowCap, Language::En) => {
                "the row limit must be a literal number".to_string()
            }
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.describe(Language::En), self.code())
    }
}

/// Outcome of [`SafetyGuard::evaluate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    /// The statement, possibly rewritten with a row cap
    Accepted(String),
    Rejected(RejectReason),
}

impl SafetyVerdict {
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Convert to a `Result` for `?` propagation
    pub fn into_result(self) -> Result<String, RejectReason> {
        match self {
            Self::Accepted(sql) => Ok(sql),
            Self::Rejected(reason) => Err(reason),
        }
    }
}

/// Stateless statement vetter bound to a policy
#[derive(Debug, Clone)]
pub struct SafetyGuard {
    policy: GuardPolicy,
}

/// Evaluate with default object policy and a single row limit
///
/// `row_limit` serves as both the inserted cap and the clamp ceiling.
#[must_use]
pub fn evaluate(sql: &str, row_limit: u64, dialect: SqlDialect) -> SafetyVerdict {
    SafetyGuard::new(GuardPolicy::new(dialect, row_limit, row_limit)).evaluate(sql)
}

/// A splice into the source text; `start == end` is an insertion
struct Edit {
    start: usize,
    end: usize,
    text: String,
}

impl Edit {
    fn insert(at: usize, text: String) -> Self {
        Self { start: at, end: at, text }
    }
}

impl SafetyGuard {
    #[must_use]
    pub const fn new(policy: GuardPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub const fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    #[must_use]
    pub fn dialect(&self) -> SqlDialect {
        self.policy.dialect
    }

    /// Judge a statement and return it row-capped, or say why not
    #[must_use]
    pub fn evaluate(&self, sql: &str) -> SafetyVerdict {
        match self.vet(sql) {
            Ok(accepted) => SafetyVerdict::Accepted(accepted),
            Err(reason) => {
                tracing::debug!(code = reason.code(), "guard rejected statement");
                SafetyVerdict::Rejected(reason)
            }
        }
    }

    fn vet(&self, sql: &str) -> Result<String, RejectReason> {
        let tokens = lexer::tokenize(sql, self.policy.dialect).map_err(|e| {
            tracing::debug!(error = %e, "guard could not tokenize statement");
            RejectReason::Malformed
        })?;
        let significant: Vec<Token<'_>> = tokens.into_iter().filter(Token::is_significant).collect();

        let first = significant
            .iter()
            .position(|t| t.kind != TokenKind::Semicolon)
            .ok_or(RejectReason::Empty)?;
        let last = significant
            .iter()
            .rposition(|t| t.kind != TokenKind::Semicolon)
            .ok_or(RejectReason::Empty)?;
        let body = &significant[first..=last];

        if body.iter().any(|t| t.kind == TokenKind::Semicolon) {
            return Err(RejectReason::MultipleStatements);
        }

        if !(body[0].is_word("SELECT") || body[0].is_word("WITH")) {
            return Err(RejectReason::NotReadOnly);
        }

        if has_stray_select(body) {
            return Err(RejectReason::MultipleStatements);
        }

        check_keywords(body)?;
        check_locking(body)?;

        if self.policy.objects.is_configured() {
            self.check_objects(body)?;
        }

        let mut edits = match self.policy.dialect.row_cap_style() {
            RowCapStyle::Top => self.top_edits(body)?,
            RowCapStyle::Limit => self.limit_edits(body)?,
        };

        // Leading comments and terminators fall outside the slice
        let base = body[0].start;
        let mut statement = sql[base..body[body.len() - 1].end()].to_string();
        edits.sort_by(|a, b| b.start.cmp(&a.start));
        for edit in edits {
            statement.replace_range(edit.start - base..edit.end - base, &edit.text);
        }

        Ok(statement)
    }

    fn check_objects(&self, body: &[Token<'_>]) -> Result<(), RejectReason> {
        // Whether a FROM list is open, per parenthesis depth
        let mut in_from: Vec<bool> = Vec::new();
        let mut i = 0;

        while i < body.len() {
            let token = &body[i];
            let depth = token.depth as usize;
            if in_from.len() <= depth {
                in_from.resize(depth + 1, false);
            }

            if token.is_word("FROM") {
                in_from[depth] = true;
                i += 1;
                continue;
            }
            if FROM_TERMINATORS.iter().any(|k| token.is_word(k)) {
                in_from[depth] = false;
            }

            let Some(name) = token.ident_name() else {
                i += 1;
                continue;
            };

            let (parts, next) = collect_chain(body, i, name);
            let qualified = parts.join(".");
            let table_position = i > 0
                && match &body[i - 1] {
                    prev if prev.kind == TokenKind::Word => {
                        prev.is_word("FROM") || prev.is_word("JOIN") || prev.is_word("APPLY")
                    }
                    prev => prev.is_punct(',') && in_from[depth],
                };

            let lowered: Vec<String> = parts.iter().map(|p| p.to_lowercase()).collect();
            if parts.len() >= 2 && SYSTEM_SCHEMAS.contains(&lowered[0].as_str()) {
                return Err(RejectReason::SystemObject(qualified));
            }
            if lowered.iter().any(|p| {
                SYSTEM_OBJECTS.contains(&p.as_str()) || SYSTEM_PREFIXES.iter().any(|x| p.starts_with(x))
            }) {
                return Err(RejectReason::SystemObject(qualified));
            }
            if parts.iter().any(String::is_empty)
                || parts.len() >= 4
                || (parts.len() == 3 && table_position)
            {
                return Err(RejectReason::CrossDatabase(qualified));
            }
            if parts.len() == 2 && table_position && !self.policy.objects.allows(&parts[0]) {
                return Err(RejectReason::SchemaNotAllowed(parts[0].clone()));
            }

            i = next;
        }

        Ok(())
    }

    fn top_edits(&self, body: &[Token<'_>]) -> Result<Vec<Edit>, RejectReason> {
        if let Some(at) = rfind_top_level(body, "FETCH") {
            return Ok(self.clamp_fetch(body, at)?.into_iter().collect());
        }
        if rfind_top_level(body, "OFFSET").is_some() {
            let end = body[body.len() - 1].end();
            let text = format!(" FETCH NEXT {} ROWS ONLY", self.policy.preview_limit);
            return Ok(vec![Edit::insert(end, text)]);
        }

        let Some(first) = body.iter().position(|t| t.depth == 0 && t.is_word("SELECT")) else {
            return Err(RejectReason::NotReadOnly);
        };
        if !is_compound(&body[first..]) {
            return Ok(self.top_for_select(body, first)?.into_iter().collect());
        }

        // A compound is capped as a whole; TOP on each branch would not bound the union
        let limit = self.policy.preview_limit;
        let end = body[body.len() - 1].end();
        if rfind_top_level(body, "ORDER").is_some() {
            return Ok(vec![Edit::insert(end, format!(" OFFSET 0 ROWS FETCH NEXT {limit} ROWS ONLY"))]);
        }
        Ok(vec![
            Edit::insert(body[first].start, format!("SELECT TOP {limit} * FROM (")),
            Edit::insert(end, ") AS capped".to_string()),
        ])
    }

    /// Effective row cap of an accepted statement, at most `max_rows`
    ///
    /// Executors fetch no more than this, so a statement whose cap the guard
    /// inserted or clamped never yields more rows than the cap says.
    #[must_use]
    pub fn row_cap(&self, accepted: &str) -> u64 {
        let max = self.policy.max_rows;
        let Ok(tokens) = lexer::tokenize(accepted, self.policy.dialect) else {
            return self.policy.preview_limit;
        };
        let body: Vec<Token<'_>> = tokens.into_iter().filter(Token::is_significant).collect();
        let number = |i: usize| -> Option<u64> {
            body.get(i).filter(|t| t.kind == TokenKind::Number).and_then(|t| t.text.parse().ok())
        };

        let fetch = rfind_top_level(&body, "FETCH").map(|at| {
            let next = if body.get(at + 1).is_some_and(|t| t.is_word("FIRST") || t.is_word("NEXT")) {
                at + 2
            } else {
                at + 1
            };
            number(next).unwrap_or(1)
        });

        let cap = match self.policy.dialect.row_cap_style() {
            RowCapStyle::Top => fetch.or_else(|| {
                let at = body.iter().position(|t| t.depth == 0 && t.is_word("SELECT"))?;
                let mut next = at + 1;
                if body.get(next).is_some_and(|t| t.is_word("DISTINCT") || t.is_word("ALL")) {
                    next += 1;
                }
                if !body.get(next).is_some_and(|t| t.is_word("TOP")) {
                    return None;
                }
                number(next + 1).or_else(|| number(next + 2))
            }),
            RowCapStyle::Limit => rfind_top_level(&body, "LIMIT")
                .and_then(|at| {
                    if body.get(at + 2).is_some_and(|t| t.is_punct(',')) {
                        number(at + 3)
                    } else {
                        number(at + 1)
                    }
                })
                .or(fetch),
        };

        cap.unwrap_or(self.policy.preview_limit).min(max)
    }

    fn top_for_select(&self, body: &[Token<'_>], at: usize) -> Result<Option<Edit>, RejectReason> {
        let mut next = at + 1;
        let mut anchor = body[at].end();
        if body.get(next).is_some_and(|t| t.is_word("DISTINCT") || t.is_word("ALL")) {
            anchor = body[next].end();
            next += 1;
        }

        if !body.get(next).is_some_and(|t| t.is_word("TOP")) {
            let text = format!(" TOP {}", self.policy.preview_limit);
            return Ok(Some(Edit::insert(anchor, text)));
        }

        let (count, after) = match (body.get(next + 1), body.get(next + 2), body.get(next + 3)) {
            (Some(open), Some(n), Some(close))
                if open.is_punct('(') && n.kind == TokenKind::Number && close.is_punct(')') =>
            {
                (n, next + 4)
            }
            (Some(n), _, _) if n.kind == TokenKind::Number => (n, next + 2),
            _ => return Err(RejectReason::UnverifiableRowCap),
        };
        if body.get(after).is_some_and(|t| t.is_word("PERCENT")) {
            return Err(RejectReason::UnverifiableRowCap);
        }

        self.clamp(count)
    }

    fn limit_edits(&self, body: &[Token<'_>]) -> Result<Vec<Edit>, RejectReason> {
        if let Some(at) = rfind_top_level(body, "LIMIT") {
            // MySQL also accepts `LIMIT offset, count`
            let count = match (body.get(at + 1), body.get(at + 2), body.get(at + 3)) {
                (Some(a), Some(comma), Some(b))
                    if a.kind == TokenKind::Number
                        && comma.is_punct(',')
                        && b.kind == TokenKind::Number =>
                {
                    b
                }
                (Some(a), _, _) if a.kind == TokenKind::Number => a,
                _ => return Err(RejectReason::UnverifiableRowCap),
            };
            return Ok(self.clamp(count)?.into_iter().collect());
        }
        if let Some(at) = rfind_top_level(body, "FETCH") {
            return Ok(self.clamp_fetch(body, at)?.into_iter().collect());
        }

        let end = body[body.len() - 1].end();
        Ok(vec![Edit::insert(end, format!(" LIMIT {}", self.policy.preview_limit))])
    }

    /// `FETCH {FIRST|NEXT} [n] {ROW|ROWS} ONLY`; a missing count means one row
    fn clamp_fetch(&self, body: &[Token<'_>], at: usize) -> Result<Option<Edit>, RejectReason> {
        let mut next = at + 1;
        if body.get(next).is_some_and(|t| t.is_word("FIRST") || t.is_word("NEXT")) {
            next += 1;
        }
        match body.get(next) {
            Some(t) if t.kind == TokenKind::Number => {
                if body.get(next + 1).is_some_and(|t| t.is_word("PERCENT")) {
                    return Err(RejectReason::UnverifiableRowCap);
                }
                self.clamp(t)
            }
            Some(t) if t.is_word("ROW") || t.is_word("ROWS") => Ok(None),
            _ => Err(RejectReason::UnverifiableRowCap),
        }
    }

    fn clamp(&self, count: &Token<'_>) -> Result<Option<Edit>, RejectReason> {
        let n: u64 = count.text.parse().map_err(|_| RejectReason::UnverifiableRowCap)?;
        if n > self.policy.max_rows {
            Ok(Some(Edit { start: count.start, end: count.end(), text: self.policy.max_rows.to_string() }))
        } else {
            Ok(None)
        }
    }
}

fn check_keywords(body: &[Token<'_>]) -> Result<(), RejectReason> {
    for token in body.iter().filter(|t| t.kind == TokenKind::Word) {
        let upper = token.text.to_ascii_uppercase();
        if FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
            return Err(RejectReason::ForbiddenKeyword(upper));
        }
        if upper == "INTO" {
            return Err(RejectReason::SelectInto);
        }
    }
    Ok(())
}

/// Locking reads (`FOR SHARE`, `LOCK IN SHARE MODE`) take row locks
fn check_locking(body: &[Token<'_>]) -> Result<(), RejectReason> {
    for (i, token) in body.iter().enumerate() {
        let next = |k: &str| body.get(i + 1).is_some_and(|t| t.is_word(k));
        if token.is_word("FOR") && (next("SHARE") || next("KEY") || next("NO")) {
            return Err(RejectReason::ForbiddenKeyword("FOR SHARE".into()));
        }
        if token.is_word("LOCK") && next("IN") {
            return Err(RejectReason::ForbiddenKeyword("LOCK IN SHARE MODE".into()));
        }
    }
    Ok(())
}

fn is_compound(body: &[Token<'_>]) -> bool {
    body.iter().any(|t| t.depth == 0 && is_set_op(Some(t)))
}

fn is_set_op(token: Option<&Token<'_>>) -> bool {
    token.is_some_and(|t| SET_OPERATORS.iter().any(|k| t.is_word(k)))
}

/// A top-level `SELECT` after the first that no set operator introduces
///
/// Two statements run together without a terminator look like this, and so
/// does prose that happens to start with the word "select".
pub(crate) fn has_stray_select<'t, 'a: 't>(tokens: impl IntoIterator<Item = &'t Token<'a>>) -> bool {
    let mut seen = false;
    let (mut prev, mut prev2): (Option<&'t Token<'a>>, Option<&'t Token<'a>>) = (None, None);

    for token in tokens {
        if token.depth == 0 && token.is_word("SELECT") {
            let introduced = is_set_op(prev)
                || (prev.is_some_and(|p| p.is_word("ALL") || p.is_word("DISTINCT")) && is_set_op(prev2));
            if seen && !introduced {
                return true;
            }
            seen = true;
        }
        prev2 = prev;
        prev = Some(token);
    }
    false
}

/// Collect a dotted name starting at `at`; `db..t` yields an empty middle part
fn collect_chain(body: &[Token<'_>], at: usize, first: String) -> (Vec<String>, usize) {
    let mut parts = vec![first];
    let mut next = at + 1;

    while next < body.len() && body[next].is_punct('.') {
        match body.get(next + 1) {
            Some(t) if t.is_punct('.') => {
                parts.push(String::new());
                next += 1;
            }
            Some(t) => match t.ident_name() {
                Some(name) => {
                    parts.push(name);
                    next += 2;
                }
                None => break,
            },
            None => break,
        }
    }

    (parts, next)
}

fn rfind_top_level(body: &[Token<'_>], keyword: &str) -> Option<usize> {
    body.iter().rposition(|t| t.depth == 0 && t.is_word(keyword))
}

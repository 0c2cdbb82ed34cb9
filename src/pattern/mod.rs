//! Pattern Matcher
//!
//! A fixed, ordered catalog of recognized question shapes, each mapped to a
//! parameterized SQL template over the `products`, `selling` and `buying`
//! tables. Matching is containment of normalized trigger phrases; the first
//! rule in catalog order whose trigger groups are all satisfied wins.
//!
//! Parameters are integers read from the question and only ever rendered
//! into literal positions. A count prefers the number after a ranking word
//! (`top 5`, `أفضل 5`) and a threshold the number after a comparison; four
//! digit numbers in 1900..=2100 are years and never either.

mod normalize;

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::dialect::{RowCapStyle, SqlDialect};
use crate::strategy::{CandidateSql, Provenance};

pub use normalize::normalize;

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9]+").expect("valid regex"));

static RANKED_COUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:top|best|first|highest|largest|افضل|اعلي|اكبر|اول)\s+([0-9]+)\b").expect("valid regex")
});

static COMPARED_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:more than|less than|greater than|fewer than|above|below|under|at least|exceeds?|اكثر من|اقل من|فوق|تحت|يزيد عن)\s+([0-9]+)\b",
    )
    .expect("valid regex")
});

static RELATIVE_SPAN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:last|past|within|اخر|خلال)\s+([0-9]+)\s*(days?|weeks?|months?|years?|يوما|يوم|ايام|اسبوعا|اسبوع|اسابيع|شهرا|شهر|اشهر|شهور|سنه|سنوات)",
    )
    .expect("valid regex")
});

/// Fixed relative-date phrases (already normalized) and their length in days
const RELATIVE_PHRASES: &[(&str, u64)] = &[
    ("last week", 7),
    ("last month", 30),
    ("last year", 365),
    ("الاسبوع الماضي", 7),
    ("الشهر الماضي", 30),
    ("السنه الماضيه", 365),
    ("العام الماضي", 365),
];

/// How a parameter is read and bounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    /// Result size; ranked count, clamped to `1..=max_rows`
    Limit,
    /// Numeric threshold; compared value
    Threshold,
    /// Time window in days; relative-date phrase
    Days,
}

#[derive(Debug, Clone, Copy)]
struct ParamSpec {
    name: &'static str,
    kind: ParamKind,
    default: u64,
}

/// Resolved template parameters
#[derive(Debug, Default)]
struct Params(HashMap<&'static str, u64>);

impl Params {
    fn get(&self, name: &str) -> u64 {
        self.0.get(name).copied().unwrap_or_default()
    }
}

type Render = fn(&Sql, &Params) -> String;

struct Rule {
    name: &'static str,
    /// Every group must have at least one phrase contained in the question
    triggers: Vec<Vec<String>>,
    params: &'static [ParamSpec],
    render: Render,
}

impl Rule {
    fn new(
        name: &'static str,
        groups: &[&[&str]],
        params: &'static [ParamSpec],
        render: Render,
    ) -> Self {
        let triggers = groups
            .iter()
            .map(|group| group.iter().map(|phrase| normalize(phrase)).collect())
            .collect();
        Self { name, triggers, params, render }
    }

    fn fires(&self, question: &str) -> bool {
        self.triggers
            .iter()
            .all(|group| group.iter().any(|phrase| question.contains(phrase.as_str())))
    }
}

/// A fired rule and the statement it produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub rule: &'static str,
    pub candidate: CandidateSql,
}

/// Catalog-driven question matcher
pub struct PatternMatcher {
    rules: Vec<Rule>,
    sql: Sql,
    max_rows: u64,
}

impl std::fmt::Debug for PatternMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternMatcher")
            .field("rules", &self.rule_names().collect::<Vec<_>>())
            .field("dialect", &self.sql.dialect)
            .field("max_rows", &self.max_rows)
            .finish()
    }
}

impl PatternMatcher {
    /// Built-in catalog rendered for `dialect`, tables optionally schema-qualified
    #[must_use]
    pub fn new(dialect: SqlDialect, schema: Option<String>, max_rows: u64) -> Self {
        Self { rules: builtin_rules(), sql: Sql { dialect, schema }, max_rows: max_rows.max(1) }
    }

    /// Rule names in catalog order
    pub fn rule_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|r| r.name)
    }

    /// First rule whose triggers fire, rendered; `None` is a normal outcome
    #[must_use]
    pub fn match_question(&self, question: &str) -> Option<PatternMatch> {
        let normalized = normalize(question);
        let rule = self.rules.iter().find(|r| r.fires(&normalized))?;

        let mut params = Params::default();
        let mut placeholders = Vec::new();
        for spec in rule.params {
            let value = match spec.kind {
                ParamKind::Limit => {
                    number_after(&RANKED_COUNT, &normalized).map(|n| n.clamp(1, self.max_rows))
                }
                ParamKind::Threshold => number_after(&COMPARED_VALUE, &normalized),
                ParamKind::Days => relative_days(&normalized),
            };
            let value = value.unwrap_or_else(|| {
                placeholders.push(spec.name.to_string());
                spec.default.min(if spec.kind == ParamKind::Limit { self.max_rows } else { u64::MAX })
            });
            params.0.insert(spec.name, value);
        }

        let sql = (rule.render)(&self.sql, &params);
        tracing::info!(rule = rule.name, defaults = ?placeholders, "pattern matched");
        tracing::debug!(%sql, "pattern sql");

        Some(PatternMatch {
            rule: rule.name,
            candidate: CandidateSql { sql, provenance: Provenance::Pattern, placeholders },
        })
    }
}

/// Number captured by `cue`, else the first number that is not a year
fn number_after(cue: &Regex, question: &str) -> Option<u64> {
    cue.captures(question)
        .and_then(|c| c.get(1))
        .into_iter()
        .chain(NUMBER.find_iter(question).filter(|m| !is_year(m.as_str())))
        .find_map(|m| m.as_str().parse().ok())
}

fn is_year(digits: &str) -> bool {
    digits.len() == 4 && digits.parse::<u64>().is_ok_and(|y| (1900..=2100).contains(&y))
}

fn relative_days(question: &str) -> Option<u64> {
    if let Some(caps) = RELATIVE_SPAN.captures(question) {
        let n: u64 = caps[1].parse().ok()?;
        let unit = &caps[2];
        let per = if unit.starts_with("week") || unit.starts_with("اسبوع") || unit == "اسابيع" {
            7
        } else if unit.starts_with("month") || unit.starts_with("شهر") || unit == "اشهر" || unit == "شهور" {
            30
        } else if unit.starts_with("year") || unit.starts_with("سن") {
            365
        } else {
            1
        };
        return Some(n.saturating_mul(per));
    }

    RELATIVE_PHRASES
        .iter()
        .find(|(phrase, _)| question.contains(phrase))
        .map(|(_, days)| *days)
}

/// Dialect-aware renderer for identifiers and row caps
#[derive(Debug, Clone)]
pub(crate) struct Sql {
    dialect: SqlDialect,
    schema: Option<String>,
}

impl Sql {
    pub(crate) const fn new(dialect: SqlDialect, schema: Option<String>) -> Self {
        Self { dialect, schema }
    }

    /// Quoted identifier
    pub(crate) fn id(&self, name: &str) -> String {
        self.dialect.quote_ident(name)
    }

    /// Quoted, optionally schema-qualified table
    pub(crate) fn table(&self, name: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", self.id(schema), self.id(name)),
            None => self.id(name),
        }
    }

    /// `alias.column`, both quoted
    pub(crate) fn col(&self, alias: &str, column: &str) -> String {
        format!("{}.{}", self.id(alias), self.id(column))
    }

    /// `TOP n ` prefix for the TOP form, empty otherwise
    pub(crate) fn top(&self, n: u64) -> String {
        match self.dialect.row_cap_style() {
            RowCapStyle::Top => format!("TOP {n} "),
            RowCapStyle::Limit => String::new(),
        }
    }

    /// ` LIMIT n` suffix for the LIMIT form, empty otherwise
    pub(crate) fn limit(&self, n: u64) -> String {
        match self.dialect.row_cap_style() {
            RowCapStyle::Top => String::new(),
            RowCapStyle::Limit => format!(" LIMIT {n}"),
        }
    }

    pub(crate) fn month_key(&self, expr: &str) -> String {
        self.dialect.month_key(expr)
    }

    pub(crate) fn days_ago(&self, days: u64) -> String {
        self.dialect.days_ago(u32::try_from(days).unwrap_or(u32::MAX))
    }

    /// `FROM selling AS s JOIN products AS p ON s.ProductCode = p.ProductCode`
    pub(crate) fn sales_join(&self) -> String {
        format!(
            "FROM {} AS {} JOIN {} AS {} ON {} = {}",
            self.table("selling"),
            self.id("s"),
            self.table("products"),
            self.id("p"),
            self.col("s", "ProductCode"),
            self.col("p", "ProductCode"),
        )
    }

    /// `GROUP BY p.ProductCode, p.ProductName`
    pub(crate) fn group_by_product(&self) -> String {
        format!("GROUP BY {}, {}", self.col("p", "ProductCode"), self.col("p", "ProductName"))
    }
}

const LIMIT_10: &[ParamSpec] = &[ParamSpec { name: "limit", kind: ParamKind::Limit, default: 10 }];
const THRESHOLD_5: &[ParamSpec] =
    &[ParamSpec { name: "threshold", kind: ParamKind::Threshold, default: 5 }];
const DAYS_90: &[ParamSpec] = &[ParamSpec { name: "days", kind: ParamKind::Days, default: 90 }];

fn builtin_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "all_products",
            &[&["all products", "show products", "list products", "جميع المنتجات", "كل المنتجات", "اعرض المنتجات"]],
            &[],
            render_all_products,
        ),
        Rule::new(
            "top_products_by_revenue",
            &[
                &["top", "best", "highest", "أفضل", "أعلى", "اكبر"],
                &["revenue", "الإيرادات", "ايرادات", "المبيعات المالية"],
            ],
            LIMIT_10,
            render_top_by_revenue,
        ),
        Rule::new(
            "best_selling",
            &[&["best selling", "best-selling", "top selling", "most sold", "best sellers", "أكثر مبيع", "الأكثر مبيعاً"]],
            LIMIT_10,
            render_best_selling,
        ),
        Rule::new(
            "monthly_average_above",
            &[
                &["per month", "monthly", "a month", "شهرياً", "في الشهر"],
                &["more than", "greater than", "above", "at least", "exceed", "أكثر من", "فوق", "يزيد عن"],
            ],
            THRESHOLD_5,
            render_monthly_average,
        ),
        Rule::new(
            "active_months_at_least",
            &[&["distinct months", "different months", "شهر مختلف", "أشهر مختلفة"]],
            THRESHOLD_5,
            render_active_months,
        ),
        Rule::new(
            "stagnant_products",
            &[&["stagnant", "slow moving", "not sold in", "not sold within", "راكد", "الراكدة", "لم تبع خلال", "لم تُبع خلال"]],
            DAYS_90,
            render_stagnant,
        ),
        Rule::new(
            "purchased_never_sold",
            &[&["purchased but never sold", "bought but never sold", "bought not sold", "never sold", "تم شراؤها ولكن لم تباع", "لم تبع أبدا"]],
            &[],
            render_never_sold,
        ),
        Rule::new(
            "low_stock",
            &[&["low stock", "out of stock", "running out", "مخزون منخفض", "المخزون المنخفض", "نقص المخزون"]],
            THRESHOLD_5,
            render_low_stock,
        ),
        Rule::new(
            "revenue_by_product",
            &[&["revenue", "total sales", "إجمالي الإيرادات", "إجمالي المبيعات", "الإيرادات"]],
            &[],
            render_revenue_by_product,
        ),
    ]
}

fn render_all_products(q: &Sql, _: &Params) -> String {
    format!(
        "SELECT {}, {}, {}, {} FROM {} ORDER BY {}",
        q.id("ProductCode"),
        q.id("ProductName"),
        q.id("Quantity"),
        q.id("Classification"),
        q.table("products"),
        q.id("ProductName"),
    )
}

fn render_top_by_revenue(q: &Sql, p: &Params) -> String {
    let n = p.get("limit");
    format!(
        "SELECT {top}{code}, {name}, SUM({qty} * {price}) AS {total} {join} {group} ORDER BY {total} DESC{limit}",
        top = q.top(n),
        code = q.col("p", "ProductCode"),
        name = q.col("p", "ProductName"),
        qty = q.col("s", "QuantitySold"),
        price = q.col("s", "SellingPrice"),
        total = q.id("TotalRevenue"),
        join = q.sales_join(),
        group = q.group_by_product(),
        limit = q.limit(n),
    )
}

fn render_best_selling(q: &Sql, p: &Params) -> String {
    let n = p.get("limit");
    format!(
        "SELECT {top}{code}, {name}, SUM({qty}) AS {total} {join} {group} ORDER BY {total} DESC{limit}",
        top = q.top(n),
        code = q.col("p", "ProductCode"),
        name = q.col("p", "ProductName"),
        qty = q.col("s", "QuantitySold"),
        total = q.id("TotalSold"),
        join = q.sales_join(),
        group = q.group_by_product(),
        limit = q.limit(n),
    )
}

fn render_monthly_average(q: &Sql, p: &Params) -> String {
    let qty = q.col("s", "QuantitySold");
    format!(
        "SELECT {code}, {name}, AVG({qty}) AS {avg}, COUNT(DISTINCT {month}) AS {months} {join} {group} HAVING AVG({qty}) > {threshold} ORDER BY {avg} DESC",
        code = q.col("p", "ProductCode"),
        name = q.col("p", "ProductName"),
        avg = q.id("AvgMonthlySales"),
        month = q.month_key(&q.col("s", "Date")),
        months = q.id("MonthsActive"),
        join = q.sales_join(),
        group = q.group_by_product(),
        threshold = p.get("threshold"),
    )
}

fn render_active_months(q: &Sql, p: &Params) -> String {
    let month = q.month_key(&q.col("s", "Date"));
    format!(
        "SELECT {code}, {name}, COUNT(DISTINCT {month}) AS {months} {join} {group} HAVING COUNT(DISTINCT {month}) >= {threshold} ORDER BY {months} DESC",
        code = q.col("p", "ProductCode"),
        name = q.col("p", "ProductName"),
        months = q.id("MonthsWithSales"),
        join = q.sales_join(),
        group = q.group_by_product(),
        threshold = p.get("threshold"),
    )
}

fn render_stagnant(q: &Sql, p: &Params) -> String {
    format!(
        "SELECT DISTINCT {code}, {name} FROM {buying} AS {b} JOIN {products} AS {p} ON {b_code} = {code} \
         WHERE NOT EXISTS (SELECT 1 FROM {selling} AS {s} WHERE {s_code} = {b_code} AND {date} >= {since}) \
         ORDER BY {name}",
        code = q.col("p", "ProductCode"),
        name = q.col("p", "ProductName"),
        buying = q.table("buying"),
        products = q.table("products"),
        selling = q.table("selling"),
        b = q.id("b"),
        p = q.id("p"),
        s = q.id("s"),
        b_code = q.col("b", "ProductCode"),
        s_code = q.col("s", "ProductCode"),
        date = q.col("s", "Date"),
        since = q.days_ago(p.get("days")),
    )
}

fn render_never_sold(q: &Sql, _: &Params) -> String {
    format!(
        "SELECT DISTINCT {code}, {name}, {class} FROM {buying} AS {b} JOIN {products} AS {p} ON {b_code} = {code} \
         WHERE {b_code} NOT IN (SELECT DISTINCT {bare_code} FROM {selling}) ORDER BY {name}",
        code = q.col("p", "ProductCode"),
        name = q.col("p", "ProductName"),
        class = q.col("p", "Classification"),
        buying = q.table("buying"),
        products = q.table("products"),
        selling = q.table("selling"),
        b = q.id("b"),
        p = q.id("p"),
        b_code = q.col("b", "ProductCode"),
        bare_code = q.id("ProductCode"),
    )
}

fn render_low_stock(q: &Sql, p: &Params) -> String {
    format!(
        "SELECT {code}, {name}, {qty}, {class} FROM {products} WHERE {qty} <= {threshold} ORDER BY {qty} ASC, {name}",
        code = q.id("ProductCode"),
        name = q.id("ProductName"),
        qty = q.id("Quantity"),
        class = q.id("Classification"),
        products = q.table("products"),
        threshold = p.get("threshold"),
    )
}

fn render_revenue_by_product(q: &Sql, _: &Params) -> String {
    let qty = q.col("s", "QuantitySold");
    format!(
        "SELECT {code}, {name}, SUM({qty}) AS {total_qty}, SUM({qty} * {price}) AS {revenue} {join} {group} ORDER BY {revenue} DESC",
        code = q.col("p", "ProductCode"),
        name = q.col("p", "ProductName"),
        total_qty = q.id("TotalQuantity"),
        price = q.col("s", "SellingPrice"),
        revenue = q.id("TotalRevenue"),
        join = q.sales_join(),
        group = q.group_by_product(),
    )
}

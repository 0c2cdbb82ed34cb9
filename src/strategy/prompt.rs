//! Prompt construction
//!
//! Every prompt lists the schema the model may use and ends with an answer
//! frame. SQL prompts use `<SQL> ... </SQL>` with `</SQL>` as stop sequence.

use std::fmt::Write as _;

use crate::dialect::SqlDialect;
use crate::engine::SchemaSummary;

pub const SQL_OPEN: &str = "<SQL>";
pub const SQL_CLOSE: &str = "</SQL>";

/// What the model is told about the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    pub dialect: SqlDialect,
    /// Schema tables are qualified with (`dbo`, `public`)
    pub schema: Option<String>,
    pub summary: SchemaSummary,
}

impl PromptContext {
    #[must_use]
    pub const fn new(dialect: SqlDialect, schema: Option<String>, summary: SchemaSummary) -> Self {
        Self { dialect, schema, summary }
    }

    fn qualified(&self, table: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{table}"),
            None => table.to_string(),
        }
    }

    /// Table and column listing, or table names only when columns are unknown
    #[must_use]
    pub fn schema_block(&self) -> String {
        if self.summary.tables.is_empty() {
            return "Use only the tables that exist in the database.\n".to_string();
        }

        if !self.summary.has_columns() {
            let names: Vec<String> = self.summary.tables.iter().map(|t| self.qualified(&t.name)).collect();
            return format!("Use only tables: {}.\n", names.join(", "));
        }

        let mut block = String::from("Tables and columns (use ONLY these exact names):\n");
        for table in &self.summary.tables {
            let columns: Vec<String> =
                table.columns.iter().map(|c| format!("{} ({})", c.name, c.data_type)).collect();
            let _ = writeln!(block, "- {}: {}", self.qualified(&table.name), columns.join(", "));
        }
        block
    }

    /// One short, unique alias per table (`p` for products, `s` for selling)
    #[must_use]
    pub fn aliases(&self) -> Vec<(String, String)> {
        let mut taken: Vec<String> = Vec::new();
        let mut aliases = Vec::new();

        for table in &self.summary.tables {
            let lower = table.name.to_ascii_lowercase();
            let letters: String = lower.chars().filter(char::is_ascii_alphanumeric).collect();
            let alias = (1..=letters.len())
                .map(|n| letters[..n].to_string())
                .find(|candidate| !taken.contains(candidate))
                .unwrap_or_else(|| format!("t{}", aliases.len() + 1));
            taken.push(alias.clone());
            aliases.push((alias, table.name.clone()));
        }

        aliases
    }

    fn house_rules(&self) -> String {
        let dialect = self.dialect.display_name();
        let mut rules = String::from("Rules:\n");
        let _ = writeln!(rules, "- Output ONE read-only SELECT statement in {dialect} syntax.");
        rules.push_str("- No comments, no prose, no data changes.\n");
        if let Some(schema) = &self.schema {
            let _ = writeln!(rules, "- Use the explicit schema {schema}.");
        }
        let aliases = self.aliases();
        if !aliases.is_empty() {
            let listed: Vec<String> =
                aliases.iter().map(|(alias, table)| format!("{alias} = {}", self.qualified(table))).collect();
            let _ = writeln!(rules, "- Use aliases: {}.", listed.join(", "));
        }
        rules.push_str("- If aggregating, GROUP BY every selected column that is not aggregated.\n");
        rules
    }
}

fn answer_frame(out: &mut String) {
    let _ = write!(out, "Return ONLY inside tags:\n{SQL_OPEN}\nSELECT ... ;\n{SQL_CLOSE}\n");
}

/// Single-shot SQL prompt
#[must_use]
pub fn sql_prompt(question: &str, ctx: &PromptContext) -> String {
    let mut prompt = format!(
        "You are a senior {} engineer. Generate ONLY one SQL SELECT statement.\n\n",
        ctx.dialect.display_name()
    );
    prompt.push_str(&ctx.schema_block());
    prompt.push('\n');
    prompt.push_str(&ctx.house_rules());
    let _ = write!(prompt, "\nQuestion: {question}\n\n");
    answer_frame(&mut prompt);
    prompt
}

/// Agent planning prompt
#[must_use]
pub fn planner_prompt(question: &str, ctx: &PromptContext) -> String {
    format!(
        "You are a BI planner for a {} database.\n\
         Return a compact plan (bullets): tables, key columns, filters.\n\n\
         {}\n\
         Question: {question}\n\n\
         Plan:\n",
        ctx.dialect.display_name(),
        ctx.schema_block(),
    )
}

/// A rejected draft and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redraft<'a> {
    pub previous_sql: &'a str,
    pub feedback: &'a str,
}

/// Agent drafting prompt, informed by the plan and optionally a rejected draft
#[must_use]
pub fn writer_prompt(
    question: &str,
    steps: &[String],
    redraft: Option<&Redraft<'_>>,
    ctx: &PromptContext,
) -> String {
    let mut prompt = format!("You are a senior {} engineer.\n", ctx.dialect.display_name());
    prompt.push_str(&ctx.schema_block());
    prompt.push_str(&ctx.house_rules());
    prompt.push_str("- Prefer a single SELECT; no temp tables.\n\nPlan:\n");
    for step in steps {
        let _ = writeln!(prompt, "- {step}");
    }
    if let Some(redraft) = redraft {
        let _ = write!(
            prompt,
            "\nA previous draft was rejected.\nReason: {}\nPrevious draft:\n{}\n",
            redraft.feedback, redraft.previous_sql
        );
    }
    let _ = write!(prompt, "\nQuestion: {question}\n\n");
    answer_frame(&mut prompt);
    prompt
}

/// Agent self-check prompt
#[must_use]
pub fn verify_prompt(question: &str, sql: &str, ctx: &PromptContext) -> String {
    format!(
        "You review SQL for a {} database.\n\
         {}\n\
         Question: {question}\n\
         SQL:\n{sql}\n\n\
         Does the SQL answer the question using only the listed tables and columns?\n\
         Reply with exactly one line: VERDICT: OK or VERDICT: FIX <reason>\n",
        ctx.dialect.display_name(),
        ctx.schema_block(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ColumnSummary, TableSummary};

    fn shop() -> PromptContext {
        let column = |name: &str, ty: &str| ColumnSummary { name: name.into(), data_type: ty.into() };
        PromptContext::new(
            SqlDialect::SqlServer,
            Some("dbo".into()),
            SchemaSummary {
                tables: vec![
                    TableSummary {
                        name: "products".into(),
                        columns: vec![column("ProductCode", "nvarchar"), column("ProductName", "nvarchar")],
                    },
                    TableSummary {
                        name: "selling".into(),
                        columns: vec![column("ProductCode", "nvarchar"), column("QuantitySold", "int")],
                    },
                    TableSummary { name: "buying".into(), columns: vec![column("NetCost", "decimal")] },
                    TableSummary { name: "batches".into(), columns: vec![column("BatchNo", "int")] },
                ],
            },
        )
    }

    #[test]
    fn test_aliases_are_unique_prefixes() {
        let aliases = shop().aliases();
        let short: Vec<&str> = aliases.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(short, vec!["p", "s", "b", "ba"]);
    }

    #[test]
    fn test_schema_block_lists_columns() {
        let block = shop().schema_block();
        assert!(block.contains("- dbo.products: ProductCode (nvarchar), ProductName (nvarchar)"));
        assert!(block.contains("- dbo.selling: ProductCode (nvarchar), QuantitySold (int)"));
    }

    #[test]
    fn test_schema_block_names_only() {
        let ctx = PromptContext::new(
            SqlDialect::Sqlite,
            None,
            SchemaSummary::from_names(["products", "selling"]),
        );
        assert_eq!(ctx.schema_block(), "Use only tables: products, selling.\n");
    }

    #[test]
    fn test_sql_prompt_frame() {
        let prompt = sql_prompt("أفضل 10 منتجات", &shop());
        assert!(prompt.starts_with("You are a senior SQL Server (T-SQL) engineer."));
        assert!(prompt.contains("- Use the explicit schema dbo."));
        assert!(prompt.contains("- Use aliases: p = dbo.products, s = dbo.selling, b = dbo.buying, ba = dbo.batches."));
        assert!(prompt.contains("Question: أفضل 10 منتجات"));
        assert!(prompt.ends_with("<SQL>\nSELECT ... ;\n</SQL>\n"));
    }

    #[test]
    fn test_writer_prompt_carries_plan_and_feedback() {
        let steps = vec!["join selling to products".to_string(), "sum QuantitySold".to_string()];
        let redraft = Redraft { previous_sql: "SELECT s.Qty FROM dbo.selling s", feedback: "unknown column s.Qty" };
        let prompt = writer_prompt("best sellers", &steps, Some(&redraft), &shop());

        assert!(prompt.contains("Plan:\n- join selling to products\n- sum QuantitySold\n"));
        assert!(prompt.contains("Reason: unknown column s.Qty"));
        assert!(prompt.contains("Previous draft:\nSELECT s.Qty FROM dbo.selling s"));
    }

    #[test]
    fn test_verify_prompt_asks_for_verdict() {
        let prompt = verify_prompt("best sellers", "SELECT 1", &shop());
        assert!(prompt.contains("VERDICT: OK or VERDICT: FIX <reason>"));
        assert!(prompt.contains("SQL:\nSELECT 1\n"));
    }
}

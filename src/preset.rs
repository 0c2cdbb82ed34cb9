//! Preset Registry
//!
//! Named, pre-authored statements that bypass generation. The catalog is built
//! once at startup from the built-in reports (rendered for the configured
//! dialect and schema) and an optional JSON file, and is read-only afterwards.
//!
//! File format: an array of `{"name", "description", "sql"}` objects. An entry
//! whose name matches a built-in replaces it. Every entry must pass the guard
//! when the catalog is built; presets still pass the guard again before they
//! run.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dialect::SqlDialect;
use crate::error::{AskError, Result};
use crate::guard::SafetyGuard;
use crate::pattern::Sql;

/// A named statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub sql: String,
}

/// Process-wide preset catalog, ordered by name
#[derive(Debug, Clone, Default)]
pub struct PresetCatalog {
    presets: BTreeMap<String, Preset>,
}

impl PresetCatalog {
    /// Built-in reports for `dialect`, tables optionally schema-qualified
    #[must_use]
    pub fn builtin(dialect: SqlDialect, schema: Option<String>) -> Self {
        let q = Sql::new(dialect, schema);
        let presets = builtin_presets(&q).into_iter().map(|p| (p.name.clone(), p)).collect();
        Self { presets }
    }

    /// Built-ins plus `file`, every entry vetted by `guard`
    pub fn load(guard: &SafetyGuard, schema: Option<String>, file: Option<&Path>) -> Result<Self> {
        let mut catalog = Self::builtin(guard.dialect(), schema);
        if let Some(file) = file {
            catalog = catalog.with_entries(read_presets_file(file)?);
        }
        catalog.validate(guard)?;
        tracing::debug!(presets = catalog.len(), "preset catalog loaded");
        Ok(catalog)
    }

    /// Add entries, replacing same-named ones
    #[must_use]
    pub fn with_entries(mut self, entries: Vec<Preset>) -> Self {
        for preset in entries {
            self.presets.insert(preset.name.clone(), preset);
        }
        self
    }

    /// Fail with `ConfigError` on the first entry the guard rejects
    pub fn validate(&self, guard: &SafetyGuard) -> Result<()> {
        for preset in self.presets.values() {
            if preset.name.trim().is_empty() {
                return Err(AskError::config_error("Preset with an empty name"));
            }
            if let Err(reason) = guard.evaluate(&preset.sql).into_result() {
                return Err(AskError::config_error(format!(
                    "Preset '{}' rejected by the guard: {reason}",
                    preset.name
                )));
            }
        }
        Ok(())
    }

    /// Name to description
    #[must_use]
    pub fn list(&self) -> BTreeMap<String, String> {
        self.presets.iter().map(|(name, p)| (name.clone(), p.description.clone())).collect()
    }

    pub fn get(&self, name: &str) -> Result<&Preset> {
        self.presets.get(name).ok_or_else(|| AskError::preset_not_found(name))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.presets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}

fn read_presets_file(path: &Path) -> Result<Vec<Preset>> {
    let contents = fs::read_to_string(path).map_err(|e| {
        AskError::config_error(format!("Failed to read presets file {}: {e}", path.display()))
    })?;
    serde_json::from_str(&contents).map_err(|e| {
        AskError::config_error(format!("Failed to parse presets file {}: {e}", path.display()))
    })
}

fn preset(name: &str, description: &str, sql: String) -> Preset {
    Preset { name: name.to_string(), description: description.to_string(), sql }
}

fn builtin_presets(q: &Sql) -> Vec<Preset> {
    let code = q.col("p", "ProductCode");
    let name = q.col("p", "ProductName");
    let qty = q.col("s", "QuantitySold");
    let price = q.col("s", "SellingPrice");
    let month = q.month_key(&q.col("s", "Date"));
    let margin = format!("{price} - COALESCE({}, 0)", q.col("s", "ManufacturerCost"));

    vec![
        preset(
            "monthly_revenue",
            "الإيرادات الشهرية الإجمالية / Total revenue per month",
            format!(
                "SELECT {month} AS {m}, SUM({qty} * {price}) AS {revenue} FROM {selling} AS {s} GROUP BY {month} ORDER BY {m}",
                m = q.id("Month"),
                revenue = q.id("TotalRevenue"),
                selling = q.table("selling"),
                s = q.id("s"),
            ),
        ),
        preset(
            "approx_profit_per_product",
            "صافي الربح لكل منتج (تقريبي) / Approximate profit per product",
            format!(
                "SELECT {code}, {name}, SUM({qty} * ({margin})) AS {profit}, SUM({qty}) AS {total} {join} {group} ORDER BY {profit} DESC",
                profit = q.id("ApproxProfit"),
                total = q.id("TotalQty"),
                join = q.sales_join(),
                group = q.group_by_product(),
            ),
        ),
        preset(
            "stagnant_90_days",
            "المنتجات الراكدة (تم الشراء ولم تُبع خلال 90 يوماً) / Purchased but not sold in 90 days",
            format!(
                "SELECT DISTINCT {code}, {name} FROM {buying} AS {b} JOIN {products} AS {p} ON {b_code} = {code} \
                 WHERE NOT EXISTS (SELECT 1 FROM {selling} AS {s} WHERE {s_code} = {b_code} AND {date} >= {since}) \
                 ORDER BY {name}",
                buying = q.table("buying"),
                products = q.table("products"),
                selling = q.table("selling"),
                b = q.id("b"),
                p = q.id("p"),
                s = q.id("s"),
                b_code = q.col("b", "ProductCode"),
                s_code = q.col("s", "ProductCode"),
                date = q.col("s", "Date"),
                since = q.days_ago(90),
            ),
        ),
        preset(
            "buy_sell_gap",
            "الفجوة بين الشراء والبيع (كمية ومالياً) لكل منتج / Bought versus sold per product",
            format!(
                "SELECT {code}, {name}, SUM(COALESCE({net_qty}, {buy_qty})) AS {qty_bought}, SUM({qty}) AS {qty_sold}, \
                 SUM(COALESCE({net_cost}, {buy_cost})) AS {cost_bought}, SUM({qty} * {price}) AS {revenue_sold} \
                 FROM {products} AS {p} LEFT JOIN {buying} AS {b} ON {b_code} = {code} \
                 LEFT JOIN {selling} AS {s} ON {s_code} = {code} {group} \
                 ORDER BY SUM({qty} * {price}) - SUM(COALESCE({net_cost}, {buy_cost})) DESC",
                net_qty = q.col("b", "NetQuantity"),
                buy_qty = q.col("b", "QuantityBuying"),
                net_cost = q.col("b", "NetCost"),
                buy_cost = q.col("b", "CostBuying"),
                qty_bought = q.id("QtyBought"),
                qty_sold = q.id("QtySold"),
                cost_bought = q.id("CostBought"),
                revenue_sold = q.id("RevenueSold"),
                products = q.table("products"),
                buying = q.table("buying"),
                selling = q.table("selling"),
                p = q.id("p"),
                b = q.id("b"),
                s = q.id("s"),
                b_code = q.col("b", "ProductCode"),
                s_code = q.col("s", "ProductCode"),
                group = q.group_by_product(),
            ),
        ),
        preset(
            "top_average_margin",
            "أفضل 10 منتجات حسب الهامش المتوسط (سعر البيع - تكلفة المصنع) / Top 10 by average margin",
            format!(
                "SELECT {top}{code}, {name}, AVG({margin}) AS {avg}, COUNT({id}) AS {tx} {join} {group} \
                 HAVING COUNT({id}) >= 5 ORDER BY {avg} DESC{limit}",
                top = q.top(10),
                avg = q.id("AvgMargin"),
                id = q.col("s", "SellingID"),
                tx = q.id("Transactions"),
                join = q.sales_join(),
                group = q.group_by_product(),
                limit = q.limit(10),
            ),
        ),
        preset(
            "low_stock",
            "تنبيهات مخزون منخفض (Quantity <= 5) / Low stock alerts",
            format!(
                "SELECT {code}, {pname}, {stock}, {class} FROM {products} WHERE {stock} <= 5 ORDER BY {stock} ASC, {pname}",
                code = q.id("ProductCode"),
                pname = q.id("ProductName"),
                stock = q.id("Quantity"),
                class = q.id("Classification"),
                products = q.table("products"),
            ),
        ),
        preset(
            "store_performance",
            "أداء الفروع/المخازن حسب الإيراد / Revenue per store",
            format!(
                "SELECT {store}, SUM({qty} * {price}) AS {revenue}, SUM({qty}) AS {total} FROM {selling} AS {s} \
                 GROUP BY {store} ORDER BY {revenue} DESC",
                store = q.col("s", "Store"),
                revenue = q.id("Revenue"),
                total = q.id("Qty"),
                selling = q.table("selling"),
                s = q.id("s"),
            ),
        ),
        preset(
            "steady_monthly_activity",
            "المنتجات ذات النشاط الشهري المستمر (>= 6 أشهر مختلفة) / Sold in at least 6 distinct months",
            format!(
                "SELECT {code}, {name}, COUNT(DISTINCT {month}) AS {months} {join} {group} \
                 HAVING COUNT(DISTINCT {month}) >= 6 ORDER BY {months} DESC",
                months = q.id("MonthsWithSales"),
                join = q.sales_join(),
                group = q.group_by_product(),
            ),
        ),
    ]
}

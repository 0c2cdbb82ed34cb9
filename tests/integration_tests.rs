//! End-to-End Pipeline Tests
//!
//! Every route runs against a real `SQLite` shop database through the same
//! `QueryService` the CLI and MCP server use. The generation service is a
//! scripted fake that answers by prompt role (planner, writer, reviewer,
//! single-shot), so no model is needed. These tests check that:
//! - Pattern and preset SQL is valid for the engine and returns the expected rows
//! - Manual SQL is capped, and write statements never reach the database
//! - LLM and agent routes see the described schema and report their metrics
//! - Agent timeouts end in the LLM fallback without changing the route

#![cfg(feature = "sqlite")]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;

use askql::engine::Executor;
use askql::generation::{Completion, GenerationRequest};
use askql::{
    AppConfig, AskError, ErrorEnvelope, GenerationClient, Language, QueryService, Request, Route,
    Strategy,
};
use pretty_assertions::assert_eq;
use serde_json::json;

// ============================================================================
// Test Helpers
// ============================================================================

/// Create the shop fixture: products, selling, buying
fn create_shop_db() -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!("askql_it_{}_{id}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let conn = rusqlite::Connection::open(&path).expect("Failed to create temp database");
    conn.execute_batch(
        "CREATE TABLE products (
             ProductCode TEXT PRIMARY KEY,
             ProductName TEXT NOT NULL,
             Quantity INTEGER NOT NULL,
             Classification TEXT
         );
         CREATE TABLE selling (
             SellingID INTEGER PRIMARY KEY,
             ProductCode TEXT NOT NULL,
             QuantitySold INTEGER NOT NULL,
             SellingPrice REAL NOT NULL,
             ManufacturerCost REAL,
             Date TEXT NOT NULL,
             Store TEXT
         );
         CREATE TABLE buying (
             BuyingID INTEGER PRIMARY KEY,
             ProductCode TEXT NOT NULL,
             QuantityBuying INTEGER,
             NetQuantity INTEGER,
             CostBuying REAL,
             NetCost REAL,
             Date TEXT
         );
         INSERT INTO products VALUES
             ('P1', 'Laptop', 3, 'Electronics'),
             ('P2', 'Mouse', 40, 'Accessories'),
             ('P3', 'Desk', 0, 'Furniture'),
             ('P4', 'Lamp', 12, 'Furniture');
         INSERT INTO selling (ProductCode, QuantitySold, SellingPrice, ManufacturerCost, Date, Store) VALUES
             ('P1', 2, 1000.0, 600.0, '2026-01-10', 'Main'),
             ('P1', 1, 1000.0, 600.0, '2026-02-11', 'Main'),
             ('P2', 10, 20.0, 8.0, '2026-01-15', 'Airport'),
             ('P2', 5, 20.0, 8.0, '2026-03-02', 'Main'),
             ('P4', 1, 50.0, 30.0, '2026-02-20', 'Airport');
         INSERT INTO buying (ProductCode, QuantityBuying, NetQuantity, CostBuying, NetCost, Date) VALUES
             ('P1', 5, 5, 3000.0, 3000.0, '2025-12-01'),
             ('P2', 50, 50, 400.0, 400.0, '2025-12-01'),
             ('P3', 4, 4, 800.0, 800.0, '2025-12-05'),
             ('P4', 2, NULL, 60.0, NULL, '2025-12-05');",
    )
    .expect("Failed to seed database");

    path
}

fn cleanup_db(path: &Path) {
    let _ = std::fs::remove_file(path);
}

fn row_count(path: &Path, table: &str) -> i64 {
    let conn = rusqlite::Connection::open(path).expect("Failed to open database");
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0)).expect("count")
}

/// Answers by prompt role; writer answers are consumed in order
struct Shop {
    plan: &'static str,
    plan_delay: Duration,
    drafts: Mutex<VecDeque<&'static str>>,
    verdict: &'static str,
    single: &'static str,
    calls: Mutex<Vec<&'static str>>,
}

impl Shop {
    fn single(sql: &'static str) -> Self {
        Self {
            plan: "",
            plan_delay: Duration::ZERO,
            drafts: Mutex::new(VecDeque::new()),
            verdict: "VERDICT: OK",
            single: sql,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

impl GenerationClient for Shop {
    async fn generate(&self, request: &GenerationRequest) -> askql::Result<Completion> {
        let prompt = request.prompt.as_str();
        let (role, text) = if prompt.starts_with("You are a BI planner") {
            tokio::time::sleep(self.plan_delay).await;
            ("plan", self.plan)
        } else if prompt.starts_with("You review SQL") {
            ("verify", self.verdict)
        } else if prompt.contains("\nPlan:\n") {
            let draft = self.drafts.lock().unwrap().pop_front();
            ("draft", draft.ok_or_else(|| AskError::generation_failed("no draft scripted"))?)
        } else {
            ("single", self.single)
        };
        self.calls.lock().unwrap().push(role);

        Ok(Completion {
            text: text.to_string(),
            model: Some("sqlcoder:7b".into()),
            prompt_tokens: 200,
            completion_tokens: 25,
            duration: Duration::from_millis(40),
        })
    }

    fn model(&self) -> &str {
        "sqlcoder:7b"
    }
}

fn config_for(path: &Path, extra: serde_json::Value) -> AppConfig {
    let base = json!({
        "database": { "engine": "sqlite", "file": path },
        "schema": { "tables": ["products", "selling", "buying"] }
    });
    AppConfig::from_layers([base, extra]).expect("valid config")
}

fn service_for(config: &AppConfig, client: Shop) -> (Arc<Shop>, QueryService<Shop, Executor>) {
    let client = Arc::new(client);
    let executor = Executor::from_config(&config.connection().unwrap()).unwrap();
    let service = QueryService::new(config, Arc::clone(&client), Arc::new(executor)).unwrap();
    (client, service)
}

fn names(rows: &[serde_json::Map<String, serde_json::Value>]) -> Vec<&str> {
    rows.iter().map(|r| r["ProductName"].as_str().unwrap()).collect()
}

// ============================================================================
// Pattern Route
// ============================================================================

#[tokio::test]
async fn test_arabic_top_products_by_revenue() {
    let path = create_shop_db();
    let (client, service) = service_for(&config_for(&path, json!({})), Shop::single(""));

    let payload = service
        .handle(Request::new(Strategy::Pattern("أفضل 10 منتجات من حيث الإيرادات".into())))
        .await
        .unwrap();

    assert_eq!(payload.route, Route::Pattern);
    assert!(payload.sql.ends_with("LIMIT 10"));
    assert_eq!(names(&payload.rows), vec!["Laptop", "Mouse", "Lamp"]);
    assert_eq!(payload.rows[0]["TotalRevenue"], json!(3000.0));
    assert!(payload.metrics.is_zero());
    assert!(!payload.via_fallback);
    assert_eq!(payload.summary, "عدد الصفوف المعروضة: 3 | الأعمدة: ProductCode, ProductName, TotalRevenue");
    assert!(client.calls().is_empty());

    cleanup_db(&path);
}

#[tokio::test]
async fn test_every_pattern_rule_runs_on_sqlite() {
    let path = create_shop_db();
    let (_, service) = service_for(&config_for(&path, json!({})), Shop::single(""));

    let questions = [
        "show all products",
        "top 5 products by revenue",
        "best selling products",
        "products selling more than 3 per month",
        "products sold in 2 different months",
        "stagnant products in the last 30 days",
        "products bought but never sold",
        "low stock below 3",
        "total sales by product",
    ];
    for question in questions {
        let payload = service.handle(Request::new(Strategy::Pattern(question.into()))).await;
        assert!(payload.is_ok(), "{question}: {:?}", payload.err());
    }

    let never_sold = service
        .handle(Request::new(Strategy::Pattern("products bought but never sold".into())))
        .await
        .unwrap();
    assert_eq!(names(&never_sold.rows), vec!["Desk"]);

    let low_stock =
        service.handle(Request::new(Strategy::Pattern("low stock below 3".into()))).await.unwrap();
    assert_eq!(names(&low_stock.rows), vec!["Desk", "Laptop"]);

    cleanup_db(&path);
}

#[tokio::test]
async fn test_unmatched_pattern_answers_through_llm() {
    let path = create_shop_db();
    let client = Shop::single("<SQL>SELECT ProductName FROM products WHERE Classification = 'Furniture' ORDER BY ProductName</SQL>");
    let (client, service) = service_for(&config_for(&path, json!({})), client);

    let payload = service
        .handle(Request::new(Strategy::Pattern("which items are furniture".into())))
        .await
        .unwrap();

    assert_eq!(payload.route, Route::Pattern);
    assert!(payload.via_fallback);
    assert_eq!(names(&payload.rows), vec!["Desk", "Lamp"]);
    assert_eq!(payload.metrics.total_tokens, 225);
    assert_eq!(client.calls(), vec!["single"]);

    cleanup_db(&path);
}

// ============================================================================
// Raw and Preset Routes
// ============================================================================

#[tokio::test]
async fn test_raw_select_star_gets_the_preview_cap() {
    let path = create_shop_db();
    let (_, service) = service_for(&config_for(&path, json!({})), Shop::single(""));

    let payload =
        service.handle(Request::new(Strategy::Raw("SELECT * FROM products".into()))).await.unwrap();

    assert_eq!(payload.route, Route::Raw);
    assert_eq!(payload.sql, "SELECT * FROM products LIMIT 200");
    assert_eq!(payload.row_count(), 4);
    assert_eq!(payload.columns, vec!["ProductCode", "ProductName", "Quantity", "Classification"]);

    cleanup_db(&path);
}

#[tokio::test]
async fn test_raw_delete_is_rejected_and_nothing_changes() {
    let path = create_shop_db();
    let (_, service) = service_for(&config_for(&path, json!({})), Shop::single(""));

    let err =
        service.handle(Request::new(Strategy::Raw("DELETE FROM Products".into()))).await.unwrap_err();

    assert!(matches!(err, AskError::ManualSqlRejected(_)));
    assert_eq!(row_count(&path, "products"), 4);

    cleanup_db(&path);
}

#[tokio::test]
async fn test_preview_limit_from_config_layers() {
    let path = create_shop_db();
    let config = config_for(&path, json!({ "preview_limit": 2, "max_rows": 3 }));
    let (_, service) = service_for(&config, Shop::single(""));

    let payload =
        service.handle(Request::new(Strategy::Raw("SELECT * FROM products".into()))).await.unwrap();
    assert_eq!(payload.sql, "SELECT * FROM products LIMIT 2");
    assert_eq!(payload.row_count(), 2);

    // An explicit cap above max_rows is clamped
    let payload = service
        .handle(Request::new(Strategy::Raw("SELECT * FROM products LIMIT 100".into())))
        .await
        .unwrap();
    assert_eq!(payload.row_count(), 3);

    cleanup_db(&path);
}

#[tokio::test]
async fn test_missing_table_is_execution_error_without_detail() {
    let path = create_shop_db();
    let (_, service) = service_for(&config_for(&path, json!({})), Shop::single(""));

    let err = service
        .handle(Request::new(Strategy::Raw("SELECT * FROM missing_table".into())))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "EXECUTION_FAILED");

    let envelope = ErrorEnvelope::from_error("raw", &err, Language::En);
    assert!(!envelope.error.message.contains("missing_table"));

    cleanup_db(&path);
}

#[tokio::test]
async fn test_every_builtin_preset_runs_on_sqlite() {
    let path = create_shop_db();
    let (_, service) = service_for(&config_for(&path, json!({})), Shop::single(""));

    let presets = service.list_presets();
    assert_eq!(presets.len(), 8);
    for name in presets.keys() {
        let payload = service.handle(Request::new(Strategy::Preset(name.clone()))).await;
        let payload = payload.unwrap_or_else(|e| panic!("{name}: {e}"));
        assert_eq!(payload.route, Route::Preset);
        assert_eq!(payload.preset_name.as_deref(), Some(name.as_str()));
    }

    let stores =
        service.handle(Request::new(Strategy::Preset("store_performance".into()))).await.unwrap();
    assert_eq!(stores.rows[0]["Store"], json!("Main"));

    cleanup_db(&path);
}

#[tokio::test]
async fn test_unknown_preset_executes_nothing() {
    let path = create_shop_db();
    let (_, service) = service_for(&config_for(&path, json!({})), Shop::single(""));

    let err = service.handle(Request::new(Strategy::Preset("nope".into()))).await.unwrap_err();
    assert!(matches!(err, AskError::PresetNotFound(_)));

    cleanup_db(&path);
}

// ============================================================================
// LLM and Agent Routes
// ============================================================================

#[tokio::test]
async fn test_llm_route_uses_described_schema() {
    let path = create_shop_db();
    let client = Shop::single("<SQL>SELECT ProductName FROM products WHERE Quantity = 0</SQL>");
    let (_, service) = service_for(&config_for(&path, json!({})), client);

    let payload = service
        .handle(Request::new(Strategy::Llm("which products are sold out".into())))
        .await
        .unwrap();

    assert_eq!(payload.route, Route::Llm);
    assert_eq!(names(&payload.rows), vec!["Desk"]);
    assert_eq!(payload.model.as_deref(), Some("sqlcoder:7b"));
    assert_eq!(payload.summary, "Rows: 1 | columns: ProductName");

    let summary = service.schema().await;
    assert!(summary.table("products").unwrap().columns.iter().any(|c| c.name == "Classification"));

    cleanup_db(&path);
}

#[tokio::test]
async fn test_llm_route_unsafe_generation_is_a_hard_stop() {
    let path = create_shop_db();
    let client = Shop::single("<SQL>SELECT * INTO products_copy FROM products</SQL>");
    let (client, service) = service_for(&config_for(&path, json!({})), client);

    let err = service.handle(Request::new(Strategy::Llm("copy the products".into()))).await.unwrap_err();

    assert_eq!(err.error_code(), "UNSAFE_GENERATION");
    assert_eq!(client.calls(), vec!["single"]);

    cleanup_db(&path);
}

#[tokio::test]
async fn test_agent_plans_drafts_and_checks() {
    let path = create_shop_db();
    let client = Shop {
        plan: "- use products\n- keep rows with Quantity = 0",
        drafts: Mutex::new(VecDeque::from(["<SQL>SELECT p.ProductName FROM products AS p WHERE p.Quantity = 0</SQL>"])),
        ..Shop::single("")
    };
    let (client, service) = service_for(&config_for(&path, json!({})), client);

    let payload = service
        .handle(Request::new(Strategy::Agent("which products are sold out".into())))
        .await
        .unwrap();

    assert_eq!(payload.route, Route::Agent);
    assert!(!payload.via_fallback);
    assert_eq!(payload.plan.as_ref().unwrap().steps.len(), 2);
    assert_eq!(names(&payload.rows), vec!["Desk"]);
    assert_eq!(payload.metrics.total_tokens, 3 * 225);
    assert_eq!(payload.metrics.generation_ms, 3 * 40);
    assert_eq!(client.calls(), vec!["plan", "draft", "verify"]);

    cleanup_db(&path);
}

#[tokio::test]
async fn test_agent_redrafts_after_unknown_column() {
    let path = create_shop_db();
    let client = Shop {
        plan: "- use products\n- keep rows with Quantity = 0",
        drafts: Mutex::new(VecDeque::from([
            "<SQL>SELECT p.ProductName FROM products AS p WHERE p.Quantty = 0</SQL>",
            "<SQL>SELECT p.ProductName FROM products AS p WHERE p.Quantity = 0</SQL>",
        ])),
        ..Shop::single("")
    };
    let (client, service) = service_for(&config_for(&path, json!({})), client);

    let payload = service
        .handle(Request::new(Strategy::Agent("which products are sold out".into())))
        .await
        .unwrap();

    assert!(payload.sql.contains("p.Quantity = 0"));
    assert!(!payload.via_fallback);
    assert_eq!(client.calls(), vec!["plan", "draft", "draft", "verify"]);

    cleanup_db(&path);
}

#[tokio::test]
async fn test_agent_timeout_falls_back_and_keeps_route() {
    let path = create_shop_db();
    let client = Shop {
        plan: "- use products",
        plan_delay: Duration::from_millis(400),
        ..Shop::single("<SQL>SELECT ProductName FROM products WHERE Quantity = 0</SQL>")
    };
    let config = config_for(&path, json!({ "agent": { "call_timeout": "100ms" } }));
    let (client, service) = service_for(&config, client);

    let payload = service
        .handle(Request::new(Strategy::Agent("which products are sold out".into())))
        .await
        .unwrap();

    assert_eq!(payload.route, Route::Agent);
    assert!(payload.via_fallback);
    assert_eq!(payload.plan, None);
    assert_eq!(payload.metrics.total_tokens, 225);
    assert_eq!(names(&payload.rows), vec!["Desk"]);
    // The abandoned planning call never completed
    assert_eq!(client.calls(), vec!["single"]);

    cleanup_db(&path);
}

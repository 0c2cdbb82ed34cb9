//! MCP (Model Context Protocol) Server
//!
//! Manual JSON-RPC 2.0 over stdio, one request per line, one response per
//! line. No MCP-specific crates: `serde_json` and `anyhow` only.
//!
//! # MCP Tools
//!
//! - `ask` - answer a question through the pattern, llm or agent route
//! - `run_sql` - execute caller-supplied SQL after the guard
//! - `list_presets` - preset names and descriptions
//! - `run_preset` - execute a named preset
//! - `check_sql` - run the guard only
//!
//! Tool failures are tool results with `isError: true` carrying the same
//! error envelope the CLI prints. JSON-RPC errors are reserved for protocol
//! problems (bad JSON, unknown method, unknown tool, missing arguments).
//!
//! # Usage
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "askql": {
//!       "command": "askql",
//!       "args": ["mcp"]
//!     }
//!   }
//! }
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, Write};

use crate::engine::QueryExecutor;
use crate::generation::GenerationClient;
use crate::i18n::Language;
use crate::output::{ErrorEnvelope, SuccessEnvelope};
use crate::service::{QueryService, Request};
use crate::strategy::Strategy;

// ============================================================================
// JSON-RPC 2.0 Structures
// ============================================================================

/// JSON-RPC 2.0 Request
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn result(id: Option<Value>, value: Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), id, result: Some(value), error: None }
    }

    fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError { code, message }),
        }
    }
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

// ============================================================================
// MCP Tool Result Structures
// ============================================================================

/// Text content block for MCP tool results
#[derive(Debug, Serialize)]
struct TextContent {
    #[serde(rename = "type")]
    content_type: String,
    text: String,
}

/// MCP tool call result
#[derive(Debug, Serialize)]
struct CallToolResult {
    content: Vec<TextContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

impl CallToolResult {
    fn new(envelope: &impl Serialize, is_error: bool) -> Result<Value> {
        let text = serde_json::to_string_pretty(envelope)?;
        let result = Self {
            content: vec![TextContent { content_type: "text".to_string(), text }],
            is_error,
        };
        Ok(serde_json::to_value(result)?)
    }

    fn success(route: &str, data: impl Serialize) -> Result<Value> {
        Self::new(&SuccessEnvelope::new(route, data), false)
    }

    fn failure(envelope: &ErrorEnvelope) -> Result<Value> {
        Self::new(envelope, true)
    }
}

// ============================================================================
// MCP Server
// ============================================================================

/// Serve stdin/stdout until stdin closes
#[allow(clippy::future_not_send)]
pub async fn serve<G: GenerationClient, E: QueryExecutor>(service: &QueryService<G, E>) -> Result<()> {
    let stdin = std::io::stdin();
    serve_lines(service, stdin.lock(), std::io::stdout()).await
}

/// Answer each JSON-RPC line of `reader` on `writer`
///
/// Notifications (requests without an id) are processed but not answered.
#[allow(clippy::future_not_send)]
pub async fn serve_lines<G, E, R, W>(service: &QueryService<G, E>, reader: R, mut writer: W) -> Result<()>
where
    G: GenerationClient,
    E: QueryExecutor,
    R: BufRead,
    W: Write,
{
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) if request.id.is_none() => {
                tracing::debug!(method = %request.method, "notification");
                continue;
            }
            Ok(request) => handle_request(service, request).await,
            Err(e) => JsonRpcResponse::error(None, -32700, format!("Parse error: {e}")),
        };

        writeln!(writer, "{}", serde_json::to_string(&response)?)?;
        writer.flush()?;
    }

    Ok(())
}

async fn handle_request<G: GenerationClient, E: QueryExecutor>(
    service: &QueryService<G, E>,
    request: JsonRpcRequest,
) -> JsonRpcResponse {
    let result = match request.method.as_str() {
        "initialize" => Ok(handle_initialize()),
        "ping" => Ok(serde_json::json!({})),
        "tools/list" => Ok(handle_list_tools()),
        "tools/call" => handle_call_tool(service, request.params).await,
        _ => {
            return JsonRpcResponse::error(
                request.id,
                -32601,
                format!("Unknown method: {}", request.method),
            )
        }
    };

    match result {
        Ok(value) => JsonRpcResponse::result(request.id, value),
        Err(e) => JsonRpcResponse::error(request.id, -32602, e.to_string()),
    }
}

// ============================================================================
// MCP Protocol Handlers
// ============================================================================

fn handle_initialize() -> Value {
    serde_json::json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {
            "tools": {}
        },
        "serverInfo": {
            "name": "askql",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

fn handle_list_tools() -> Value {
    let lang = serde_json::json!({
        "type": "string",
        "enum": ["ar", "en"],
        "description": "Answer language. Questions are detected from their script when omitted; raw SQL and presets default to Arabic."
    });

    serde_json::json!({
        "tools": [
            {
                "name": "ask",
                "description": "Answer a natural-language question (Arabic or English) about the database. The question becomes one read-only SELECT, which is vetted by the guard, capped and executed. Routes: 'pattern' (cataloged question shapes, no model call; falls back to the llm route when nothing matches), 'llm' (one generation call), 'agent' (plan, draft, self-check; falls back to the llm route on timeout). Returns the SQL, columns, rows, a localized summary, token metrics and via_fallback.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "question": { "type": "string", "description": "The question" },
                        "route": {
                            "type": "string",
                            "enum": ["pattern", "llm", "agent"],
                            "description": "Strategy to use. Default: pattern."
                        },
                        "lang": lang.clone()
                    },
                    "required": ["question"]
                }
            },
            {
                "name": "run_sql",
                "description": "Execute one caller-supplied SELECT statement. Anything that is not a single read-only SELECT is rejected with MANUAL_SQL_REJECTED and never executed. Uncapped statements get the preview row cap.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "sql": { "type": "string", "description": "A single SELECT statement in the database's dialect" },
                        "lang": lang.clone()
                    },
                    "required": ["sql"]
                }
            },
            {
                "name": "list_presets",
                "description": "List the saved report queries as a map of preset name to description.",
                "inputSchema": { "type": "object", "properties": {} }
            },
            {
                "name": "run_preset",
                "description": "Execute a saved report query by name. Unknown names fail with PRESET_NOT_FOUND.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string", "description": "Preset name from list_presets" },
                        "lang": lang.clone()
                    },
                    "required": ["name"]
                }
            },
            {
                "name": "check_sql",
                "description": "Run the read-only guard on a statement without executing it. Returns whether it is accepted, the statement as it would run (with its row cap), or the rejection code and reason.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "sql": { "type": "string", "description": "Statement to check" },
                        "lang": lang.clone()
                    },
                    "required": ["sql"]
                }
            }
        ]
    })
}

async fn handle_call_tool<G: GenerationClient, E: QueryExecutor>(
    service: &QueryService<G, E>,
    params: Option<Value>,
) -> Result<Value> {
    let params = params.ok_or_else(|| anyhow!("Missing params"))?;
    let name = params["name"].as_str().ok_or_else(|| anyhow!("Missing tool name"))?;
    let arguments = &params["arguments"];
    let lang = parse_lang(arguments)?;

    match name {
        "ask" => {
            let question = required_str(arguments, "question")?;
            let strategy = match arguments.get("route").and_then(Value::as_str).unwrap_or("pattern") {
                "pattern" => Strategy::Pattern(question),
                "llm" => Strategy::Llm(question),
                "agent" => Strategy::Agent(question),
                other => return Err(anyhow!("Invalid route '{other}'. Must be pattern, llm or agent")),
            };
            tool_run(service, Request::new(strategy).with_language(lang)).await
        }
        "run_sql" => {
            let sql = required_str(arguments, "sql")?;
            tool_run(service, Request::new(Strategy::Raw(sql)).with_language(lang)).await
        }
        "run_preset" => {
            let preset = required_str(arguments, "name")?;
            tool_run(service, Request::new(Strategy::Preset(preset)).with_language(lang)).await
        }
        "list_presets" => CallToolResult::success("presets", service.list_presets()),
        "check_sql" => {
            let sql = required_str(arguments, "sql")?;
            CallToolResult::success("check", service.check(&sql, lang.unwrap_or_default()))
        }
        _ => Err(anyhow!("Unknown tool: {name}")),
    }
}

// ============================================================================
// Tool Implementations
// ============================================================================

async fn tool_run<G: GenerationClient, E: QueryExecutor>(
    service: &QueryService<G, E>,
    request: Request,
) -> Result<Value> {
    let route = request.strategy.route();
    let lang = request.language();
    match service.handle(request).await {
        Ok(payload) => CallToolResult::success(route.as_str(), payload),
        Err(e) => CallToolResult::failure(&ErrorEnvelope::from_error(route.as_str(), &e, lang)),
    }
}

fn required_str(args: &Value, field: &str) -> Result<String> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Missing required field: {field}"))
}

fn parse_lang(args: &Value) -> Result<Option<Language>> {
    match args.get("lang").and_then(Value::as_str) {
        None => Ok(None),
        Some(code) => Language::from_code(code)
            .map(Some)
            .ok_or_else(|| anyhow!("Invalid lang '{code}'. Must be 'ar' or 'en'")),
    }
}

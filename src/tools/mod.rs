/// Built-in tools — executed inside the host, no backend involved.
///
/// These exist to validate the dispatch path end-to-end: a client can call
/// `echo` against a freshly-started host with zero backends configured.
/// Built-ins are only consulted when the caller supplied no `server_id`.
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::protocol::RpcError;

// ─── Tool definition type ─────────────────────────────────────────────────────

/// A tool definition as it appears in the capabilities document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDef {
    fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

// ─── Catalogue ────────────────────────────────────────────────────────────────

pub const BUILTIN_NAMES: &[&str] = &["echo", "timestamp", "random_number"];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

/// All built-in tool definitions, in catalogue order.
pub fn builtin_tools() -> Vec<ToolDef> {
    vec![
        ToolDef::new(
            "echo",
            "Echo the given message back, with a server timestamp.",
            json!({
                "type": "object",
                "required": ["message"],
                "properties": {
                    "message": { "description": "Value to echo back verbatim." }
                },
                "additionalProperties": false
            }),
        ),
        ToolDef::new(
            "timestamp",
            "Current host time in ISO 8601.",
            json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        ),
        ToolDef::new(
            "random_number",
            "Uniform random integer in [min, max].",
            json!({
                "type": "object",
                "required": ["min", "max"],
                "properties": {
                    "min": { "type": "integer" },
                    "max": { "type": "integer" }
                },
                "additionalProperties": false
            }),
        ),
    ]
}

// ─── Execution ────────────────────────────────────────────────────────────────

/// Run a built-in by name. The caller has already checked [`is_builtin`].
pub fn execute(name: &str, params: &Value) -> Result<Value, RpcError> {
    match name {
        "echo" => echo(params),
        "timestamp" => Ok(json!({ "timestamp": now_iso8601() })),
        "random_number" => random_number(params),
        other => Err(RpcError::invalid_params(format!("unknown built-in '{other}'"))),
    }
}

fn echo(params: &Value) -> Result<Value, RpcError> {
    let message = params
        .get("message")
        .ok_or_else(|| RpcError::invalid_params("missing required field 'message'"))?;
    Ok(json!({ "echo": message, "timestamp": now_iso8601() }))
}

fn random_number(params: &Value) -> Result<Value, RpcError> {
    let min = require_int(params, "min")?;
    let max = require_int(params, "max")?;
    if min > max {
        return Err(RpcError::invalid_params(format!(
            "min ({min}) must not exceed max ({max})"
        )));
    }
    let number = rand::thread_rng().gen_range(min..=max);
    Ok(json!({ "number": number, "min": min, "max": max }))
}

fn require_int(params: &Value, key: &str) -> Result<i64, RpcError> {
    params
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| RpcError::invalid_params(format!("'{key}' must be an integer")))
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339()
}

// ─── Tests ────────────────────────────────────────────────────────────────────

//! Host dispatcher — the single entry point for client-originated JSON-RPC.
//!
//! The HTTP layer hands in the raw body; this module parses, validates,
//! routes by method, and hands back one of three reply shapes: a JSON
//! envelope, 204 for a notification, or an SSE upgrade carrying the
//! terminal envelope. JSON-RPC errors are still HTTP 200 — the error lives
//! inside the envelope.

use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, error};

use crate::bus::TOPIC_REQUESTS;
use crate::protocol::{parse_incoming, Incoming, RpcError, RpcRequest, RpcResponse};
use crate::{capabilities, tools, AppContext};

/// What the HTTP layer should send back.
#[derive(Debug)]
pub enum HttpReply {
    /// 200 with the response envelope as the JSON body.
    Json(RpcResponse),
    /// 204, empty body — the input was a Notification.
    NoContent,
    /// SSE upgrade on the same connection: the terminal response envelope
    /// goes out as a stream event, then the stream closes.
    Stream(RpcResponse),
}

/// Handle one POSTed JSON-RPC body.
pub async fn handle_post(
    ctx: &AppContext,
    client_id: &str,
    raw_body: &[u8],
    accept: Option<&str>,
) -> HttpReply {
    let started = Instant::now();

    let incoming = match parse_incoming(raw_body) {
        Ok(msg) => msg,
        Err(e) => return HttpReply::Json(RpcResponse::err(Value::Null, e)),
    };

    match incoming {
        Incoming::Notification(n) => {
            debug!(client = client_id, method = %n.method, "notification accepted");
            publish_request_event(ctx, client_id, json!(n), started, true);
            HttpReply::NoContent
        }
        Incoming::Request(req) => {
            let method = req.method.clone();
            let id = req.id.clone();
            let outcome = dispatch_request(ctx, &req).await;

            if let Err(e) = &outcome {
                if e.code == crate::protocol::INTERNAL_ERROR {
                    error!(method = %method, err = %e.message, "internal error in handler");
                }
            }

            let ok = outcome.is_ok();
            debug!(
                client = client_id,
                method = %method,
                ok,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "rpc dispatch"
            );
            publish_request_event(ctx, client_id, json!(req), started, ok);

            let response = match outcome {
                Ok(result) => RpcResponse::ok(id, result),
                Err(e) => RpcResponse::err(id, e),
            };
            if wants_stream(accept) {
                HttpReply::Stream(response)
            } else {
                HttpReply::Json(response)
            }
        }
    }
}

/// Method table. Aliases all collapse onto the same tool-call path; the
/// backend wire form is always `tools/call {name, arguments}`.
async fn dispatch_request(ctx: &AppContext, req: &RpcRequest) -> Result<Value, RpcError> {
    let params = req.params.clone().unwrap_or_else(|| json!({}));
    match req.method.as_str() {
        "initialize" => Ok(capabilities::build(ctx).await),
        "invoke_tool" | "execute" => {
            let tool = require_str(&params, "tool")?;
            let arguments = params.get("parameters").cloned().unwrap_or_else(|| json!({}));
            run_tool(ctx, opt_str(&params, "server_id"), &tool, arguments).await
        }
        // Upstream MCP schema spelling of the same call.
        "call_tool" => {
            let tool = require_str(&params, "name")?;
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            run_tool(ctx, opt_str(&params, "server_id"), &tool, arguments).await
        }
        other => Err(RpcError::method_not_found(other)),
    }
}

async fn run_tool(
    ctx: &AppContext,
    server_id: Option<String>,
    tool: &str,
    arguments: Value,
) -> Result<Value, RpcError> {
    // Built-ins answer only unaddressed calls.
    if server_id.is_none() && tools::is_builtin(tool) {
        return tools::execute(tool, &arguments);
    }
    ctx.manager
        .execute_tool(server_id.as_deref(), tool, arguments)
        .await
}

fn publish_request_event(
    ctx: &AppContext,
    client_id: &str,
    envelope: Value,
    started: Instant,
    ok: bool,
) {
    ctx.bus.publish(
        TOPIC_REQUESTS,
        json!({
            "clientId": client_id,
            "request": envelope,
            "latencyMs": started.elapsed().as_millis() as u64,
            "ok": ok,
        }),
    );
}

fn wants_stream(accept: Option<&str>) -> bool {
    accept
        .map(|a| a.contains("text/event-stream"))
        .unwrap_or(false)
}

fn require_str(params: &Value, key: &str) -> Result<String, RpcError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::invalid_params(format!("missing required field '{key}'")))
}

fn opt_str(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

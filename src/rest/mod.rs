// rest/mod.rs — the host's HTTP surface.
//
// Axum server bound to localhost:
//   GET  /mcp/stream   (SSE, one stream per client)
//   POST /mcp/rpc      (JSON-RPC; /mcp accepted as an alias)
//   GET  /health
//
// JSON-RPC errors are HTTP 200 with the error inside the envelope; 204 for
// notifications; an SSE reply on POST when the client asked for one via
// Accept. Every response carries x-mcp-client-id, echoed from the request
// header or freshly minted.

pub mod sse;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::stream;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use crate::dispatch::{self, HttpReply};
use crate::rest::sse::CLIENT_ID_HEADER;
use crate::AppContext;

/// Bind the listener. Kept separate from [`serve`] so `main` can map a bind
/// failure to its own exit code.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

/// Serve until a shutdown signal arrives.
pub async fn serve(listener: TcpListener, ctx: Arc<AppContext>) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "mcpd listening");
    axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("http server stopped");
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/mcp/stream", get(sse::client_stream))
        .route("/mcp/rpc", post(rpc))
        .route("/mcp", post(rpc))
        .route("/health", get(health))
        .with_state(ctx)
}

async fn rpc(State(ctx): State<Arc<AppContext>>, headers: HeaderMap, body: Bytes) -> Response {
    let client_id = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());

    let reply = dispatch::handle_post(&ctx, &client_id, &body, accept).await;
    let id_header = [(HeaderName::from_static(CLIENT_ID_HEADER), client_id)];
    match reply {
        HttpReply::Json(resp) => (StatusCode::OK, id_header, Json(resp)).into_response(),
        HttpReply::NoContent => (StatusCode::NO_CONTENT, id_header).into_response(),
        HttpReply::Stream(resp) => {
            let data = serde_json::to_string(&resp).unwrap_or_default();
            let one_shot = stream::once(async move {
                Ok::<_, Infallible>(Event::default().event("message").data(data))
            });
            (id_header, Sse::new(one_shot)).into_response()
        }
    }
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let backends: Vec<serde_json::Value> = ctx
        .manager
        .snapshot()
        .await
        .into_iter()
        .map(|b| json!({ "id": b.backend_id, "status": b.status.as_str(), "tools": b.tools.len() }))
        .collect();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "backends": backends,
    }))
}

/// Resolves on SIGTERM (Unix) or Ctrl-C.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

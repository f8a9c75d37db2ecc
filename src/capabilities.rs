//! The merged capabilities document.
//!
//! Returned by the `initialize` RPC and pushed as the first event on every
//! SSE stream. Repeat calls against unchanged state are byte-identical:
//! every map in the document is key-ordered.

use serde_json::{json, Map, Value};

use crate::{AppContext, HOST_NAME, PROTOCOL_VERSION};

/// A resource advertised alongside the tool catalogue.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// The host's static resource list.
pub fn host_resources() -> Vec<ResourceDescriptor> {
    vec![
        ResourceDescriptor {
            uri: "mcp://host/backends".to_string(),
            name: "Backends".to_string(),
            description: "Configured backend servers and their status".to_string(),
            mime_type: "application/json".to_string(),
        },
        ResourceDescriptor {
            uri: "mcp://host/tools".to_string(),
            name: "Tools".to_string(),
            description: "Merged tool routing table across all backends".to_string(),
            mime_type: "application/json".to_string(),
        },
    ]
}

/// Build the capabilities document: tool schemas from every running backend
/// plus the built-ins, per-backend detail, and the resource list.
///
/// Built-ins win a name collision with a backend tool because the
/// dispatcher consults them first for unaddressed calls.
pub async fn build(ctx: &AppContext) -> Value {
    let mut tools: Map<String, Value> = Map::new();
    for (name, route) in ctx.manager.routing_snapshot().await {
        tools.insert(name, route.schema);
    }
    for def in crate::tools::builtin_tools() {
        tools.insert(
            def.name.clone(),
            json!({
                "description": def.description,
                "inputSchema": def.input_schema,
            }),
        );
    }

    let mut servers: Map<String, Value> = Map::new();
    for snap in ctx.manager.snapshot().await {
        servers.insert(
            snap.backend_id.clone(),
            json!({
                "status": snap.status.as_str(),
                "autoApprove": snap.auto_approve,
                "tools": snap.tools,
            }),
        );
    }

    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "serverInfo": {
            "name": HOST_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": { "tools": tools },
        "servers": servers,
        "resources": host_resources(),
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────────

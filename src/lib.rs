pub mod backend;
pub mod bus;
pub mod capabilities;
pub mod config;
pub mod dispatch;
pub mod protocol;
pub mod rest;
pub mod tools;

use std::sync::Arc;
use std::time::Instant;

use backend::ServerManager;
use bus::NotificationBus;
use config::HostConfig;

/// Host name sent in the `clientInfo` of every backend handshake and in the
/// capabilities document.
pub const HOST_NAME: &str = "mcpd";

/// MCP protocol version this host speaks.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Shared application state passed to every HTTP handler and background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<HostConfig>,
    pub bus: Arc<NotificationBus>,
    pub manager: Arc<ServerManager>,
    pub started_at: Instant,
}

#[cfg(test)]
pub(crate) fn test_context() -> Arc<AppContext> {
    Arc::new(AppContext {
        config: Arc::new(HostConfig::new(
            0,
            std::path::PathBuf::from("mcp-servers.json"),
            "warn".to_string(),
        )),
        bus: Arc::new(NotificationBus::new()),
        manager: ServerManager::new(),
        started_at: Instant::now(),
    })
}

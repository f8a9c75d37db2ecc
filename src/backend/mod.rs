//! Backend pool: supervised MCP child processes and the tool routing table.

pub mod manager;
pub mod process;

pub use manager::{BackendSnapshot, RouteEntry, ServerManager};
pub use process::{BackendProcess, BackendStatus};

//! Server manager — owns every backend process and the tool→backend
//! routing table.
//!
//! The routing table is rebuilt on every backend start or stop, in config
//! order; when two backends advertise the same tool name the later one wins
//! and a warning names both. `execute_tool` is the single operation the
//! dispatcher uses: explicit `server_id` routes unconditionally, otherwise
//! the table decides.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, RestartPolicy, Transport};
use crate::protocol::{RpcError, SERVER_NOT_FOUND};

use super::process::{BackendProcess, BackendStatus};

/// Pause before respawning a backend under `restart: on_exit`.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// One row of the routing table.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub backend_id: String,
    pub schema: Value,
}

/// Point-in-time view of one backend, for capabilities and health output.
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub backend_id: String,
    pub status: BackendStatus,
    pub tools: BTreeMap<String, Value>,
    pub auto_approve: BTreeSet<String>,
}

pub struct ServerManager {
    /// Self-handle handed to per-backend monitor tasks.
    weak: Weak<ServerManager>,
    backends: RwLock<HashMap<String, Arc<BackendProcess>>>,
    /// Start order — routing precedence on name collisions.
    order: StdMutex<Vec<String>>,
    routing: RwLock<HashMap<String, RouteEntry>>,
    /// Ids stopped on purpose. A monitor sleeping out its restart delay
    /// checks this before respawning, so an explicit `stop` issued in that
    /// window sticks. Cleared again on the next launch of the same id.
    stopped_ids: StdMutex<HashSet<String>>,
}

impl ServerManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            backends: RwLock::new(HashMap::new()),
            order: StdMutex::new(Vec::new()),
            routing: RwLock::new(HashMap::new()),
            stopped_ids: StdMutex::new(HashSet::new()),
        })
    }

    /// Spawn every non-disabled backend. A single failed start is logged and
    /// skipped; the host keeps running with whatever came up.
    pub async fn start(&self, configs: Vec<BackendConfig>) {
        for cfg in configs {
            if cfg.disabled {
                debug!(backend = %cfg.backend_id, "skipping disabled backend");
                continue;
            }
            if cfg.transport == Transport::Http {
                warn!(
                    backend = %cfg.backend_id,
                    "http transport backends are not spawned — skipping"
                );
                continue;
            }
            self.launch(cfg).await;
        }
        self.rebuild_routing().await;
    }

    // Boxed to break the mutual-recursion cycle with `monitor` (which awaits
    // this future): without erasing the concrete type here, the compiler
    // cannot prove either future is `Send`.
    fn launch<'a>(
        &'a self,
        cfg: BackendConfig,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let id = cfg.backend_id.clone();
            // A fresh launch supersedes any earlier explicit stop of this id.
            self.stopped_ids
                .lock()
                .expect("stopped lock poisoned")
                .remove(&id);
            match BackendProcess::spawn(cfg.clone()).await {
                Ok(proc) => {
                    self.backends.write().await.insert(id.clone(), proc.clone());
                    {
                        let mut order = self.order.lock().expect("order lock poisoned");
                        if !order.iter().any(|o| *o == id) {
                            order.push(id.clone());
                        }
                    }
                    tokio::spawn(monitor(self.weak.clone(), proc, cfg));
                }
                Err(e) => {
                    warn!(
                        backend = %id,
                        err = %e,
                        "failed to start backend — its tools remain unavailable"
                    );
                }
            }
        })
    }

    /// Rebuild the tool→backend table from every ready backend, in start
    /// order. Later backends shadow earlier ones on name collisions.
    pub async fn rebuild_routing(&self) {
        let order = self.order.lock().expect("order lock poisoned").clone();
        let mut table: HashMap<String, RouteEntry> = HashMap::new();
        {
            let backends = self.backends.read().await;
            for id in &order {
                let Some(proc) = backends.get(id) else {
                    continue;
                };
                if proc.status() != BackendStatus::Ready {
                    continue;
                }
                for (tool, schema) in proc.tools() {
                    if let Some(prev) = table.get(&tool) {
                        warn!(
                            tool = %tool,
                            winner = %id,
                            shadowed = %prev.backend_id,
                            "tool name collision — later backend shadows earlier"
                        );
                    }
                    table.insert(
                        tool,
                        RouteEntry {
                            backend_id: id.clone(),
                            schema,
                        },
                    );
                }
            }
        }
        debug!(tools = table.len(), "routing table rebuilt");
        *self.routing.write().await = table;
    }

    /// Execute a named tool, either on an explicitly addressed backend or on
    /// whichever backend the routing table names. No parameter validation
    /// happens here; the backend owns its schemas.
    pub async fn execute_tool(
        &self,
        server_id: Option<&str>,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, RpcError> {
        let proc = match server_id {
            Some(sid) => self
                .backends
                .read()
                .await
                .get(sid)
                .cloned()
                .ok_or_else(|| {
                    RpcError::new(SERVER_NOT_FOUND, format!("no backend '{sid}'"))
                })?,
            None => {
                let backend_id = self
                    .routing
                    .read()
                    .await
                    .get(tool)
                    .map(|r| r.backend_id.clone())
                    .ok_or_else(|| {
                        RpcError::new(
                            SERVER_NOT_FOUND,
                            format!("no backend provides tool '{tool}'"),
                        )
                    })?;
                self.backends
                    .read()
                    .await
                    .get(&backend_id)
                    .cloned()
                    .ok_or_else(|| {
                        RpcError::new(SERVER_NOT_FOUND, format!("no backend '{backend_id}'"))
                    })?
            }
        };

        if proc.status() != BackendStatus::Ready {
            return Err(RpcError::new(
                SERVER_NOT_FOUND,
                format!("backend '{}' is not running", proc.backend_id()),
            ));
        }
        proc.call_tool(tool, arguments).await
    }

    /// Gracefully stop one backend. Returns false if it was not running.
    ///
    /// The stop is recorded before the pool is touched: a crashed backend
    /// whose monitor is mid restart-delay has already left the pool, and
    /// only this record keeps it from being respawned anyway.
    pub async fn stop(&self, backend_id: &str) -> bool {
        self.stopped_ids
            .lock()
            .expect("stopped lock poisoned")
            .insert(backend_id.to_string());
        let proc = self.backends.write().await.remove(backend_id);
        self.order
            .lock()
            .expect("order lock poisoned")
            .retain(|id| id != backend_id);
        match proc {
            Some(p) => {
                p.stop().await;
                self.rebuild_routing().await;
                true
            }
            None => false,
        }
    }

    /// Stop every backend, for daemon shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.backends.read().await.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    /// Snapshot of every backend, in start order.
    pub async fn snapshot(&self) -> Vec<BackendSnapshot> {
        let order = self.order.lock().expect("order lock poisoned").clone();
        let backends = self.backends.read().await;
        order
            .iter()
            .filter_map(|id| backends.get(id))
            .map(|p| BackendSnapshot {
                backend_id: p.backend_id().to_string(),
                status: p.status(),
                tools: p.tools(),
                auto_approve: p.config().auto_approve.clone(),
            })
            .collect()
    }

    /// The current routing table, sorted by tool name.
    pub async fn routing_snapshot(&self) -> BTreeMap<String, RouteEntry> {
        self.routing
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn running_count(&self) -> usize {
        self.backends.read().await.len()
    }

    fn stop_requested(&self, backend_id: &str) -> bool {
        self.stopped_ids
            .lock()
            .expect("stopped lock poisoned")
            .contains(backend_id)
    }
}

/// Watches one backend until it leaves the running states, prunes it from
/// the pool and routing table, and applies the restart policy. Holds only a
/// weak manager handle so a dropped manager ends the task.
async fn monitor(manager: Weak<ServerManager>, proc: Arc<BackendProcess>, cfg: BackendConfig) {
    let mut status = proc.status_watch();
    loop {
        let current = *status.borrow();
        if matches!(current, BackendStatus::Stopped | BackendStatus::Failed) {
            break;
        }
        if status.changed().await.is_err() {
            break;
        }
    }

    let Some(this) = manager.upgrade() else {
        return;
    };
    {
        let mut backends = this.backends.write().await;
        match backends.get(proc.backend_id()) {
            // A restart may already have replaced this entry.
            Some(current) if Arc::ptr_eq(current, &proc) => {
                backends.remove(proc.backend_id());
            }
            _ => return,
        }
    }
    this.rebuild_routing().await;

    if proc.is_deliberate_stop() {
        return;
    }
    warn!(backend = %proc.backend_id(), "backend exited unexpectedly");

    if cfg.restart == RestartPolicy::OnExit {
        drop(this);
        tokio::time::sleep(RESTART_DELAY).await;
        let Some(this) = manager.upgrade() else {
            return;
        };
        if this.stop_requested(&cfg.backend_id) {
            info!(
                backend = %cfg.backend_id,
                "explicitly stopped during restart delay — not respawning"
            );
            return;
        }
        info!(backend = %cfg.backend_id, "restart policy on_exit — respawning");
        this.launch(cfg).await;
        this.rebuild_routing().await;
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_tool_is_server_not_found() {
        let manager = ServerManager::new();
        let err = manager
            .execute_tool(None, "upper", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, SERVER_NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_backend_id_is_server_not_found() {
        let manager = ServerManager::new();
        let err = manager
            .execute_tool(Some("t1"), "upper", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, SERVER_NOT_FOUND);
        assert!(err.message.contains("t1"));
    }

    #[tokio::test]
    async fn stop_unknown_backend_is_false() {
        let manager = ServerManager::new();
        assert!(!manager.stop("nope").await);
    }

    #[tokio::test]
    async fn failed_spawn_does_not_poison_the_pool() {
        let manager = ServerManager::new();
        let cfg = BackendConfig {
            backend_id: "ghost".into(),
            command: "/nonexistent/binary/for/sure".into(),
            args: vec![],
            env: Default::default(),
            disabled: false,
            auto_approve: Default::default(),
            restart: RestartPolicy::None,
            transport: Transport::Stdio,
            tools: Default::default(),
        };
        manager.start(vec![cfg]).await;
        assert_eq!(manager.running_count().await, 0);
        assert!(manager.routing_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn disabled_backend_is_never_spawned() {
        let manager = ServerManager::new();
        let cfg = BackendConfig {
            backend_id: "off".into(),
            command: "/nonexistent".into(),
            args: vec![],
            env: Default::default(),
            disabled: true,
            auto_approve: Default::default(),
            restart: RestartPolicy::None,
            transport: Transport::Stdio,
            tools: Default::default(),
        };
        manager.start(vec![cfg]).await;
        assert!(manager.snapshot().await.is_empty());
    }
}

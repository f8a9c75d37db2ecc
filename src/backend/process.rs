//! One supervised MCP backend child process.
//!
//! `BackendProcess` spawns the configured executable and speaks
//! line-delimited JSON-RPC 2.0 over its stdin/stdout pipes. A single reader
//! task owns stdout and completes per-call waiters by request id; writes are
//! serialized through the stdin mutex; any number of caller tasks may invoke
//! [`BackendProcess::call_tool`] concurrently.
//!
//! Outgoing ids are monotonic from 1 — id 0 is reserved for the `initialize`
//! handshake sent immediately after spawn.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::protocol::{
    self, RpcError, RpcMessage, RpcNotification, RpcRequest, BACKEND_TERMINATED, CLIENT_CANCELLED,
    SERVER_ERROR, TOOL_TIMEOUT,
};
use crate::{HOST_NAME, PROTOCOL_VERSION};

/// Deadline for one tool call, issue to completion.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for the initialize handshake after spawn.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a stopping backend gets between stdin close and SIGKILL.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Waiter = oneshot::Sender<Result<Value, RpcError>>;

// ─── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Starting => "starting",
            BackendStatus::Ready => "ready",
            BackendStatus::Failed => "failed",
            BackendStatus::Stopped => "stopped",
        }
    }
}

// ─── BackendProcess ───────────────────────────────────────────────────────────

pub struct BackendProcess {
    /// Self-handle for the call guard, which must outlive a dropped caller.
    weak: Weak<BackendProcess>,
    config: BackendConfig,
    /// `None` once shutdown has closed the pipe.
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    /// Next outgoing request id. Starts at 1; 0 is the handshake.
    next_id: AtomicU64,
    pending: StdMutex<HashMap<u64, Waiter>>,
    /// Ids whose call timed out locally. A late response for one of these is
    /// expected, so its arrival is logged at debug instead of warn.
    tombstones: StdMutex<HashSet<u64>>,
    /// Discovered + configured tool schemas, fixed at handshake time.
    tools: StdMutex<BTreeMap<String, Value>>,
    status_tx: watch::Sender<BackendStatus>,
    deliberate_stop: AtomicBool,
    call_timeout_ms: AtomicU64,
}

impl BackendProcess {
    /// Spawn the child, wire up its pipes, and run the `initialize`
    /// handshake. Returns a ready backend or an error (the child is killed
    /// on handshake failure or timeout).
    pub async fn spawn(config: BackendConfig) -> Result<Arc<Self>> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args);
        // The child sees exactly the configured environment, plus PATH.
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.envs(&config.env);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn backend '{}'", config.backend_id))?;
        let stdin = child.stdin.take().context("backend stdin not available")?;
        let stdout = child.stdout.take().context("backend stdout not available")?;
        let stderr = child.stderr.take().context("backend stderr not available")?;

        let (status_tx, _) = watch::channel(BackendStatus::Starting);
        let proc = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            next_id: AtomicU64::new(1),
            pending: StdMutex::new(HashMap::new()),
            tombstones: StdMutex::new(HashSet::new()),
            tools: StdMutex::new(BTreeMap::new()),
            status_tx,
            deliberate_stop: AtomicBool::new(false),
            call_timeout_ms: AtomicU64::new(CALL_TIMEOUT.as_millis() as u64),
        });

        let backend_id = proc.config.backend_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(backend = %backend_id, line = %line, "backend stderr");
            }
        });

        tokio::spawn(read_loop(proc.clone(), stdout));

        let init_params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": HOST_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        match tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            proc.request(0, "initialize", Some(init_params)),
        )
        .await
        {
            Ok(Ok(result)) => {
                proc.install_tools(&result);
                // The child may have answered the handshake and exited right
                // away; a Stopped/Failed status set by the reader wins.
                proc.status_tx.send_if_modified(|s| {
                    if *s == BackendStatus::Starting {
                        *s = BackendStatus::Ready;
                        true
                    } else {
                        false
                    }
                });
                info!(
                    backend = %proc.config.backend_id,
                    tools = proc.tools().len(),
                    "backend initialized"
                );
                Ok(proc)
            }
            Ok(Err(e)) => {
                let _ = proc.status_tx.send(BackendStatus::Failed);
                proc.kill().await;
                anyhow::bail!(
                    "backend '{}' initialize failed: {} (code {})",
                    proc.config.backend_id,
                    e.message,
                    e.code
                )
            }
            Err(_) => {
                let _ = proc.status_tx.send(BackendStatus::Failed);
                proc.kill().await;
                anyhow::bail!(
                    "backend '{}' initialize timed out after {:?}",
                    proc.config.backend_id,
                    HANDSHAKE_TIMEOUT
                )
            }
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.config.backend_id
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn status(&self) -> BackendStatus {
        *self.status_tx.borrow()
    }

    /// Watch channel for the manager's monitor task.
    pub fn status_watch(&self) -> watch::Receiver<BackendStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_deliberate_stop(&self) -> bool {
        self.deliberate_stop.load(Ordering::SeqCst)
    }

    /// Tool schemas this backend serves, keyed by tool name.
    pub fn tools(&self) -> BTreeMap<String, Value> {
        self.tools.lock().expect("tools lock poisoned").clone()
    }

    /// Number of outstanding waiters.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    /// Override the per-call deadline. Test hook.
    pub fn set_call_timeout(&self, timeout: Duration) {
        self.call_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.load(Ordering::Relaxed))
    }

    // ─── Calls ──────────────────────────────────────────────────────────────

    /// Invoke a tool on this backend: `tools/call {name, arguments}`.
    ///
    /// Errors from the backend are forwarded verbatim when well-formed.
    /// A missed deadline yields `TOOL_TIMEOUT` and tombstones the id so the
    /// late reply is not mistaken for a stray. If the caller's future is
    /// dropped mid-call (client went away), the waiter is completed with
    /// `CLIENT_CANCELLED` and a best-effort `$/cancelRequest` notification
    /// goes to the backend.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        if self.status() != BackendStatus::Ready {
            return Err(RpcError::new(
                BACKEND_TERMINATED,
                format!("backend '{}' is not running", self.config.backend_id),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);
        let mut guard = CallGuard {
            proc: self.weak.clone(),
            id,
            armed: true,
        };

        let params = json!({ "name": name, "arguments": arguments });
        if let Err(e) = self
            .write_line(&RpcRequest::new(id, "tools/call", Some(params)))
            .await
        {
            guard.disarm();
            self.pending.lock().expect("pending lock poisoned").remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.call_timeout(), rx).await {
            Ok(Ok(outcome)) => {
                guard.disarm();
                outcome
            }
            Ok(Err(_closed)) => {
                guard.disarm();
                Err(RpcError::new(BACKEND_TERMINATED, "backend terminated"))
            }
            Err(_elapsed) => {
                guard.disarm();
                self.pending.lock().expect("pending lock poisoned").remove(&id);
                self.tombstones
                    .lock()
                    .expect("tombstones lock poisoned")
                    .insert(id);
                warn!(
                    backend = %self.config.backend_id,
                    id,
                    tool = name,
                    "tool call timed out"
                );
                Err(
                    RpcError::new(TOOL_TIMEOUT, "tool call timed out").with_data(json!({
                        "backend": self.config.backend_id,
                        "requestId": id,
                    })),
                )
            }
        }
    }

    /// Send a request line and await its correlated response.
    async fn request(
        &self,
        id: u64,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);

        if let Err(e) = self.write_line(&RpcRequest::new(id, method, params)).await {
            self.pending.lock().expect("pending lock poisoned").remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_closed) => Err(RpcError::new(BACKEND_TERMINATED, "backend terminated")),
        }
    }

    /// Serialize `payload` as one JSON line onto the child's stdin.
    async fn write_line(&self, payload: &impl Serialize) -> Result<(), RpcError> {
        let mut line = serde_json::to_string(payload)
            .map_err(|e| RpcError::new(SERVER_ERROR, format!("encode failed: {e}")))?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| RpcError::new(BACKEND_TERMINATED, "backend terminated"))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| RpcError::new(BACKEND_TERMINATED, format!("stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| RpcError::new(BACKEND_TERMINATED, format!("stdin flush failed: {e}")))?;
        Ok(())
    }

    // ─── Shutdown ───────────────────────────────────────────────────────────

    /// Graceful shutdown: "shutdown" notification, close stdin, wait up to
    /// [`SHUTDOWN_GRACE`], then kill.
    pub async fn stop(&self) {
        self.deliberate_stop.store(true, Ordering::SeqCst);
        let _ = self
            .write_line(&RpcNotification::new("shutdown", None))
            .await;
        *self.stdin.lock().await = None;

        let mut child_guard = self.child.lock().await;
        if let Some(child) = child_guard.as_mut() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(backend = %self.config.backend_id, %status, "backend exited")
                }
                Ok(Err(e)) => {
                    warn!(backend = %self.config.backend_id, err = %e, "wait failed")
                }
                Err(_) => {
                    warn!(
                        backend = %self.config.backend_id,
                        "backend did not exit within grace period — killing"
                    );
                    let _ = child.kill().await;
                }
            }
        }
        *child_guard = None;
        self.mark_stopped();
    }

    async fn kill(&self) {
        *self.stdin.lock().await = None;
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.kill().await;
        }
    }

    /// Terminal transition: fail every outstanding waiter. Idempotent; a
    /// handshake failure stays `Failed` rather than becoming `Stopped`.
    fn mark_stopped(&self) {
        if self.status() == BackendStatus::Failed {
            // keep Failed, but still drain waiters below
        } else if self.status() != BackendStatus::Stopped {
            let _ = self.status_tx.send(BackendStatus::Stopped);
        }

        let waiters: Vec<Waiter> = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        if !waiters.is_empty() {
            warn!(
                backend = %self.config.backend_id,
                count = waiters.len(),
                "failing outstanding calls — backend terminated"
            );
        }
        for tx in waiters {
            let _ = tx.send(Err(RpcError::new(BACKEND_TERMINATED, "backend terminated")));
        }
    }

    // ─── Reader side ────────────────────────────────────────────────────────

    /// Handle one complete line from the child's stdout.
    fn handle_line(&self, line: &[u8]) {
        let value: Value = match serde_json::from_slice(line) {
            Ok(v) => v,
            Err(_) => {
                warn!(
                    backend = %self.config.backend_id,
                    "discarding non-JSON line from backend stdout"
                );
                return;
            }
        };

        // Response path first: forwards well-formed error payloads verbatim
        // and wraps malformed ones, which `classify` cannot express.
        let is_response = value
            .as_object()
            .map(|o| o.contains_key("id") && (o.contains_key("result") || o.contains_key("error")))
            .unwrap_or(false);
        if is_response {
            self.complete_response(&value);
            return;
        }

        match protocol::classify(value) {
            Some(RpcMessage::Request(req)) => {
                // Sampling, elicitation, roots: not supported yet.
                warn!(
                    backend = %self.config.backend_id,
                    method = %req.method,
                    "ignoring server-initiated request from backend"
                );
            }
            Some(RpcMessage::Notification(n)) => {
                debug!(
                    backend = %self.config.backend_id,
                    method = %n.method,
                    "ignoring backend notification"
                );
            }
            _ => {
                warn!(
                    backend = %self.config.backend_id,
                    "discarding message that is not JSON-RPC"
                );
            }
        }
    }

    fn complete_response(&self, value: &Value) {
        let Some(obj) = value.as_object() else {
            return;
        };
        let id = match obj.get("id").and_then(Value::as_u64) {
            Some(id) => id,
            None => {
                warn!(
                    backend = %self.config.backend_id,
                    "response id is not one of our integer ids — discarded"
                );
                return;
            }
        };

        let waiter = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&id);
        let Some(tx) = waiter else {
            if self
                .tombstones
                .lock()
                .expect("tombstones lock poisoned")
                .remove(&id)
            {
                debug!(backend = %self.config.backend_id, id, "late response for timed-out call");
            } else {
                warn!(backend = %self.config.backend_id, id, "response with unknown id discarded");
            }
            return;
        };

        let outcome = if let Some(err_val) = obj.get("error") {
            match serde_json::from_value::<RpcError>(err_val.clone()) {
                Ok(e) => Err(e),
                Err(_) => Err(RpcError::new(SERVER_ERROR, "tool execution failed")
                    .with_data(json!({ "original": err_val }))),
            }
        } else {
            Ok(obj.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = tx.send(outcome);
    }

    /// Abandon an in-flight call whose client went away.
    fn abandon(&self, id: u64) {
        if let Some(tx) = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&id)
        {
            let _ = tx.send(Err(RpcError::new(CLIENT_CANCELLED, "client cancelled")));
        }
        self.tombstones
            .lock()
            .expect("tombstones lock poisoned")
            .insert(id);
    }

    fn install_tools(&self, init_result: &Value) {
        let mut tools = static_tool_fallback(&self.config.backend_id);
        if let Some(map) = init_result
            .pointer("/capabilities/tools")
            .and_then(Value::as_object)
        {
            for (name, schema) in map {
                // Some servers put flags like "listChanged" here; only
                // object-valued entries are tool schemas.
                if schema.is_object() {
                    tools.insert(name.clone(), schema.clone());
                }
            }
        }
        for (name, schema) in &self.config.tools {
            tools.insert(name.clone(), schema.clone());
        }
        *self.tools.lock().expect("tools lock poisoned") = tools;
    }
}

// ─── Call guard ───────────────────────────────────────────────────────────────

/// Cleans up after a call whose future was dropped before completion: the
/// waiter is completed with `CLIENT_CANCELLED`, the id tombstoned, and a
/// best-effort `$/cancelRequest` notification sent to the backend.
struct CallGuard {
    proc: Weak<BackendProcess>,
    id: u64,
    armed: bool,
}

impl CallGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(proc) = self.proc.upgrade() else {
            return;
        };
        let id = self.id;
        proc.abandon(id);
        debug!(backend = %proc.config.backend_id, id, "call abandoned by client");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let notif =
                    RpcNotification::new("$/cancelRequest", Some(json!({ "id": id })));
                let _ = proc.write_line(&notif).await;
            });
        }
    }
}

// ─── Reader loop ──────────────────────────────────────────────────────────────

async fn read_loop(proc: Arc<BackendProcess>, mut stdout: ChildStdout) {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                for line in drain_lines(&mut buf) {
                    proc.handle_line(&line);
                }
            }
            Err(e) => {
                warn!(backend = %proc.config().backend_id, err = %e, "backend stdout read failed");
                break;
            }
        }
    }
    if !buf.is_empty() {
        debug!(
            backend = %proc.config().backend_id,
            bytes = buf.len(),
            "discarding unterminated trailing output"
        );
    }
    proc.mark_stopped();
}

/// Split complete newline-terminated lines out of `buf`, retaining any
/// partial trailing content. CR before LF is stripped; empty lines skipped.
fn drain_lines(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if !line.is_empty() {
            out.push(line);
        }
    }
    out
}

// ─── Static fallback tools ────────────────────────────────────────────────────

/// Hard-coded tool schemas for well-known backends whose `initialize`
/// response is known to omit them. Discovered and configured schemas both
/// override these.
fn static_tool_fallback(backend_id: &str) -> BTreeMap<String, Value> {
    let mut tools = BTreeMap::new();
    match backend_id {
        "everart" => {
            tools.insert(
                "generate_image".to_string(),
                json!({
                    "description": "Generate an image from a text prompt",
                    "inputSchema": {
                        "type": "object",
                        "required": ["prompt"],
                        "properties": {
                            "prompt": { "type": "string" },
                            "model": { "type": "string" }
                        }
                    }
                }),
            );
        }
        "sqlite" => {
            tools.insert(
                "query".to_string(),
                json!({
                    "description": "Run a read-only SQL query",
                    "inputSchema": {
                        "type": "object",
                        "required": ["sql"],
                        "properties": { "sql": { "type": "string" } }
                    }
                }),
            );
        }
        _ => {}
    }
    tools
}

// ─── Tests ────────────────────────────────────────────────────────────────────

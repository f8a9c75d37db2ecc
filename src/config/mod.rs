/// Host configuration and the backend server configuration file.
///
/// Backends are declared in a JSON document (default `mcp-servers.json`):
/// ```json
/// {
///   "mcpServers": {
///     "tracker": {
///       "command": "npx",
///       "args": ["-y", "@modelcontextprotocol/server-memory"],
///       "env": { "MY_KEY": "value" },
///       "disabled": false,
///       "autoApprove": ["store_memory"],
///       "restart": "none",
///       "tools": {
///         "store_memory": {
///           "description": "Persist a fact",
///           "parameters": [
///             { "name": "text", "type": "string", "required": true }
///           ]
///         }
///       }
///     }
///   }
/// }
/// ```
/// Unknown keys are tolerated. Entries with `"disabled": true` are skipped
/// entirely. A missing file means "no backends configured" — the host still
/// serves its built-in tools.
use anyhow::{Context, Result};
use serde::de::{IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

// ─── Host config ──────────────────────────────────────────────────────────────

/// Process-level settings, resolved once at startup from CLI flags and env.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub port: u16,
    pub servers_path: PathBuf,
    pub log: String,
}

impl HostConfig {
    pub fn new(port: u16, servers_path: PathBuf, log: String) -> Self {
        Self {
            port,
            servers_path,
            log,
        }
    }
}

// ─── Backend config ───────────────────────────────────────────────────────────

/// What to do when a backend's child process exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Leave the backend stopped; its tools become unavailable.
    #[default]
    None,
    /// Respawn once per observed exit.
    OnExit,
}

/// How the host talks to a backend. Only stdio is spawned today; an `http`
/// entry is accepted in config but skipped with a warning at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Stdio,
    Http,
}

/// Immutable per-backend record, as loaded from the config file.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub backend_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub disabled: bool,
    pub auto_approve: BTreeSet<String>,
    pub restart: RestartPolicy,
    pub transport: Transport,
    /// Configured tool schemas, keyed by tool name, already converted to the
    /// JSON-Schema `inputSchema` form used everywhere else in the host.
    pub tools: BTreeMap<String, Value>,
}

// ─── Raw JSON types (for deserialization) ─────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct RawServerEntry {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default, rename = "autoApprove")]
    auto_approve: Vec<String>,
    #[serde(default)]
    restart: RestartPolicy,
    #[serde(default)]
    transport: Transport,
    #[serde(default)]
    tools: BTreeMap<String, RawToolDef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawToolDef {
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Vec<RawToolParam>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawToolParam {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    description: String,
}

/// The top-level servers file. Deserialized by hand: `mcpServers` must keep
/// its declaration order because a later entry shadows an earlier one on
/// tool-name collisions, and any map-typed field (including
/// `serde_json::Map`) would re-sort the entries by key.
#[derive(Debug)]
struct RawServersFile {
    mcp_servers: Vec<(String, RawServerEntry)>,
}

impl<'de> Deserialize<'de> for RawServersFile {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct FileVisitor;

        impl<'de> Visitor<'de> for FileVisitor {
            type Value = RawServersFile;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a servers file object")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut servers = Vec::new();
                while let Some(key) = map.next_key::<String>()? {
                    if key == "mcpServers" {
                        servers = map.next_value::<ServerEntries>()?.0;
                    } else {
                        // Unknown top-level keys are tolerated.
                        map.next_value::<IgnoredAny>()?;
                    }
                }
                Ok(RawServersFile {
                    mcp_servers: servers,
                })
            }
        }

        deserializer.deserialize_map(FileVisitor)
    }
}

/// `mcpServers` entries in document order.
struct ServerEntries(Vec<(String, RawServerEntry)>);

impl<'de> Deserialize<'de> for ServerEntries {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = ServerEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of backend id to server entry")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some((id, entry)) = map.next_entry::<String, RawServerEntry>()? {
                    entries.push((id, entry));
                }
                Ok(ServerEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

// ─── Loading ──────────────────────────────────────────────────────────────────

/// Load all backend configs from the servers file, in declaration order.
/// That order is routing precedence: on a tool-name collision the backend
/// declared later in the file wins.
///
/// A missing file yields an empty list. An unreadable or unparseable file is
/// an error — `main` maps it to exit code 1.
pub fn load_backends(path: &Path) -> Result<Vec<BackendConfig>> {
    if !path.exists() {
        debug!(path = %path.display(), "servers file not found — no backends configured");
        return Ok(Vec::new());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read servers file '{}'", path.display()))?;
    let parsed: RawServersFile = serde_json::from_str(&raw)
        .with_context(|| format!("invalid servers file '{}'", path.display()))?;

    let backends: Vec<BackendConfig> = parsed
        .mcp_servers
        .into_iter()
        .map(|(id, entry)| BackendConfig {
            backend_id: id,
            command: entry.command,
            args: entry.args,
            env: entry.env,
            disabled: entry.disabled,
            auto_approve: entry.auto_approve.into_iter().collect(),
            restart: entry.restart,
            transport: entry.transport,
            tools: entry
                .tools
                .into_iter()
                .map(|(name, def)| (name, tool_schema(&def)))
                .collect(),
        })
        .collect();

    debug!(count = backends.len(), "loaded backend configs");
    Ok(backends)
}

/// Convert a config-file tool definition to the JSON-Schema `inputSchema`
/// form reported in the capabilities document.
fn tool_schema(def: &RawToolDef) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required: Vec<Value> = Vec::new();
    for p in &def.parameters {
        let mut prop = serde_json::Map::new();
        prop.insert("type".into(), json!(p.kind));
        if !p.description.is_empty() {
            prop.insert("description".into(), json!(p.description));
        }
        properties.insert(p.name.clone(), Value::Object(prop));
        if p.required {
            required.push(json!(p.name));
        }
    }

    json!({
        "description": def.description,
        "inputSchema": {
            "type": "object",
            "properties": properties,
            "required": required,
        }
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "mcpServers": {
            "tracker": {
                "command": "/usr/local/bin/tracker-mcp",
                "args": ["--quiet"],
                "env": { "TRACKER_DB": "/tmp/db" },
                "autoApprove": ["list_items"],
                "tools": {
                    "list_items": {
                        "description": "List tracked items",
                        "parameters": [
                            { "name": "limit", "type": "number", "required": false }
                        ]
                    },
                    "add_item": {
                        "description": "Add an item",
                        "parameters": [
                            { "name": "title", "type": "string", "required": true,
                              "description": "Item title" }
                        ]
                    }
                }
            },
            "legacy": {
                "command": "legacy-mcp",
                "disabled": true,
                "someFutureKey": { "nested": true }
            }
        },
        "unknownTopLevel": 42
    }"#;

    fn write_sample(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("mcp-servers.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_entries_and_tolerates_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backends = load_backends(&write_sample(&dir)).unwrap();
        assert_eq!(backends.len(), 2);
        // Declaration order, not key order: "tracker" comes first in the
        // document even though "legacy" sorts before it.
        assert_eq!(backends[0].backend_id, "tracker");
        assert_eq!(backends[1].backend_id, "legacy");

        let tracker = backends.iter().find(|b| b.backend_id == "tracker").unwrap();
        assert_eq!(tracker.command, "/usr/local/bin/tracker-mcp");
        assert_eq!(tracker.args, vec!["--quiet"]);
        assert_eq!(tracker.env.get("TRACKER_DB").unwrap(), "/tmp/db");
        assert!(tracker.auto_approve.contains("list_items"));
        assert!(!tracker.disabled);
        assert_eq!(tracker.restart, RestartPolicy::None);
        assert_eq!(tracker.transport, Transport::Stdio);

        let legacy = backends.iter().find(|b| b.backend_id == "legacy").unwrap();
        assert!(legacy.disabled);
    }

    #[test]
    fn converts_parameters_to_input_schema() {
        let dir = tempfile::tempdir().unwrap();
        let backends = load_backends(&write_sample(&dir)).unwrap();
        let tracker = backends.iter().find(|b| b.backend_id == "tracker").unwrap();

        let add = &tracker.tools["add_item"];
        assert_eq!(add["description"], "Add an item");
        assert_eq!(add["inputSchema"]["type"], "object");
        assert_eq!(add["inputSchema"]["properties"]["title"]["type"], "string");
        assert_eq!(add["inputSchema"]["required"][0], "title");

        let list = &tracker.tools["list_items"];
        assert_eq!(list["inputSchema"]["required"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn missing_file_is_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let backends = load_backends(&dir.path().join("nope.json")).unwrap();
        assert!(backends.is_empty());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-servers.json");
        std::fs::write(&path, "{broken").unwrap();
        assert!(load_backends(&path).is_err());
    }

    #[test]
    fn declaration_order_survives_non_alphabetical_ids() {
        let raw = r#"{"mcpServers": {
            "zeta": { "command": "z" },
            "alpha": { "command": "a" },
            "midway": { "command": "m" }
        }}"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, raw).unwrap();
        let backends = load_backends(&path).unwrap();
        let ids: Vec<&str> = backends.iter().map(|b| b.backend_id.as_str()).collect();
        assert_eq!(ids, vec!["zeta", "alpha", "midway"]);
    }

    #[test]
    fn restart_policy_parses() {
        let raw = r#"{"mcpServers": {"a": {"command": "x", "restart": "on_exit"}}}"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, raw).unwrap();
        let backends = load_backends(&path).unwrap();
        assert_eq!(backends[0].restart, RestartPolicy::OnExit);
    }
}

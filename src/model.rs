//! Shared data model: server descriptors, configuration snapshots, tool
//! metadata, and the handful of small value types every other module
//! builds on.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// How the core reaches an upstream MCP server. The wire framing itself
/// is out of scope (spec §1 Non-goals) — this only captures enough to
/// hand off to the external MCP client collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportKind {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http { url: String },
    Sse { url: String },
}

impl TransportKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Stdio { .. } => "stdio",
            TransportKind::Http { .. } => "http",
            TransportKind::Sse { .. } => "sse",
        }
    }
}

/// OAuth configuration for a server. References to secrets, never raw
/// values — the secrets resolver is an external collaborator (spec §1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OAuthConfig {
    pub client_id_ref: Option<String>,
    pub client_secret_ref: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub resource: Option<String>,
}

/// Sandboxing/isolation hints. The core stores and surfaces this value
/// but never interprets it — the sandbox itself is external (spec §1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IsolationConfig {
    pub image: Option<String>,
    pub network_mode: Option<String>,
}

/// Desired-state description of one upstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerDescriptor {
    pub name: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub quarantined: bool,
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,
    #[serde(default)]
    pub isolation: Option<IsolationConfig>,
}

impl ServerDescriptor {
    /// Cheap structural validation — required fields present for the
    /// chosen transport kind. Secret resolution and reachability are
    /// not checked here (that's the adapter's job, asynchronously).
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidDescriptor {
                name: self.name.clone(),
                reason: "name must not be empty".into(),
            });
        }
        match &self.transport {
            TransportKind::Stdio { command, .. } if command.trim().is_empty() => {
                Err(Error::InvalidDescriptor {
                    name: self.name.clone(),
                    reason: "stdio transport requires a non-empty command".into(),
                })
            }
            TransportKind::Http { url } | TransportKind::Sse { url } if url.trim().is_empty() => {
                Err(Error::InvalidDescriptor {
                    name: self.name.clone(),
                    reason: format!("{} transport requires a non-empty url", self.transport.label()),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Logging defaults carried in the configuration snapshot (spec §3's
/// "the full configuration"). The core only stores and serializes
/// these — actual subscriber initialisation is `init_tracing` in
/// `lib.rs`, driven by `RUST_LOG`/`RUST_LOG_FORMAT` at process start,
/// not by a live-reloadable snapshot field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingDefaults {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingDefaults {
    fn default() -> Self {
        Self { level: "info".into(), json: false }
    }
}

/// Tokenizer defaults — which model's tokenizer to count tool-call
/// payload sizes against, and the ceiling the external code-execution
/// sandbox is configured to enforce. The core never tokenizes
/// anything itself (that's external, spec §1); this is a passthrough
/// value like `IsolationConfig`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenizerDefaults {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

/// Docker-isolation defaults applied to any `ServerDescriptor` whose
/// own `isolation` field is `None` — per-server isolation overrides
/// these, never the other way around.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DockerIsolationDefaults {
    pub image: Option<String>,
    pub network_mode: Option<String>,
}

/// An immutable, versioned configuration snapshot. `ConfigService`
/// installs these atomically; readers hold an `Arc` and never see a
/// partial update. Carries the full configuration named in spec §3:
/// listen address, data dir, logging, tokenizer, and docker-isolation
/// defaults, alongside the ordered server list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub path: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub logging: LoggingDefaults,
    #[serde(default)]
    pub tokenizer: TokenizerDefaults,
    #[serde(default)]
    pub docker_isolation_defaults: DockerIsolationDefaults,
    pub servers: Vec<ServerDescriptor>,
}

fn default_listen_address() -> String {
    "127.0.0.1:8585".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl ConfigSnapshot {
    pub fn empty(path: Option<String>) -> Self {
        Self {
            version: 0,
            path,
            timestamp: Utc::now(),
            listen_address: default_listen_address(),
            data_dir: default_data_dir(),
            logging: LoggingDefaults::default(),
            tokenizer: TokenizerDefaults::default(),
            docker_isolation_defaults: DockerIsolationDefaults::default(),
            servers: Vec::new(),
        }
    }

    pub fn server(&self, name: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// The reason an update was installed — carried on config-update events
/// so subscribers can distinguish "file reload" from "programmatic
/// edit" without inspecting the diff themselves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Initial,
    Programmatic,
    FileReload,
    PathChanged,
}

/// Who/what triggered an update — free-form, surfaced on events for
/// audit purposes. The audit backend itself is external (spec §1).
pub type UpdateSource = String;

/// Tool metadata as discovered from an upstream server's `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
    #[serde(default)]
    pub annotations: Value,
}

/// Truncate a string to `max` chars, appending `...` if truncated. Used
/// for `ConnectionInfo.last_error` (500 chars, spec §3) and reused by
/// the health calculator's error-summary path — one implementation,
/// two call sites.
pub fn truncate_with_ellipsis(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_leaves_short_strings_alone() {
        assert_eq!(truncate_with_ellipsis("short", 500), "short");
    }

    #[test]
    fn truncate_adds_ellipsis_past_limit() {
        let long = "a".repeat(600);
        let out = truncate_with_ellipsis(&long, 500);
        assert_eq!(out.chars().count(), 503);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn validate_rejects_empty_name() {
        let d = ServerDescriptor {
            name: "".into(),
            transport: TransportKind::Http { url: "http://x".into() },
            enabled: true,
            quarantined: false,
            oauth: None,
            isolation: None,
        };
        assert!(d.validate().is_err());
    }

    #[test]
    fn validate_rejects_stdio_without_command() {
        let d = ServerDescriptor {
            name: "svc".into(),
            transport: TransportKind::Stdio {
                command: "".into(),
                args: vec![],
                env: HashMap::new(),
            },
            enabled: true,
            quarantined: false,
            oauth: None,
            isolation: None,
        };
        assert!(d.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_http() {
        let d = ServerDescriptor {
            name: "svc".into(),
            transport: TransportKind::Http { url: "https://example.com/mcp".into() },
            enabled: true,
            quarantined: false,
            oauth: None,
            isolation: None,
        };
        assert!(d.validate().is_ok());
    }
}

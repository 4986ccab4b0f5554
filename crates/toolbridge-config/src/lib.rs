//! Persisted configuration for remote tool servers.
//!
//! The document is keyed by server name. Each entry selects a transport
//! (`subprocess` or `http`), carries that transport's fields, a server-level
//! `enabled` switch and a snapshot of the tools found by the last discovery.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use toolbridge_core::{Result, ToolbridgeError};

pub mod env_substitution;
pub mod mask;
pub mod store;

pub use mask::MASK;
pub use store::{ConfigStore, MemoryConfigStore, YamlConfigStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpConfigDocument {
    /// Global switch; when off no server is connected. A missing key
    /// counts as on.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for McpConfigDocument {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: BTreeMap::new(),
        }
    }
}

impl McpConfigDocument {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
            .map_err(|e| ToolbridgeError::Config(format!("Failed to parse YAML: {e}")))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| ToolbridgeError::Config(format!("Failed to serialize YAML: {e}")))
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    pub fn with_server(mut self, name: impl Into<String>, config: ServerConfig) -> Self {
        self.servers.insert(name.into(), config);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    #[serde(alias = "stdio")]
    Subprocess,
    #[serde(alias = "streamableHttp", alias = "streamable_http")]
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Subprocess => f.write_str("subprocess"),
            TransportKind::Http => f.write_str("http"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(rename = "type", default)]
    pub kind: TransportKind,

    /// Executable for the subprocess transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Overrides merged over the parent environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Endpoint for the HTTP transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub tools: Vec<ToolSnapshot>,
}

/// Persisted record of one discovered tool and the user's enablement choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSnapshot {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ToolSnapshot {
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            enabled,
            description: None,
        }
    }
}

impl ServerConfig {
    fn base(kind: TransportKind) -> Self {
        Self {
            kind,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            url: None,
            headers: BTreeMap::new(),
            enabled: true,
            request_timeout_ms: default_request_timeout_ms(),
            tools: Vec::new(),
        }
    }

    pub fn subprocess(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Self::base(TransportKind::Subprocess)
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::base(TransportKind::Http)
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSnapshot>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Check that the fields required by the selected transport are present.
    pub fn validate(&self, name: &str) -> Result<()> {
        match self.kind {
            TransportKind::Subprocess => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(ToolbridgeError::Config(format!(
                        "Server '{name}' is missing 'command'"
                    )));
                }
            }
            TransportKind::Http => {
                let url = self.url.as_deref().unwrap_or("");
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ToolbridgeError::Config(format!(
                        "Server '{name}' needs a 'url' starting with http:// or https://"
                    )));
                }
            }
        }
        if self.request_timeout_ms == 0 {
            return Err(ToolbridgeError::Config(format!(
                "Server '{name}' has a zero request timeout"
            )));
        }
        Ok(())
    }

    /// Enablement recorded for a tool, if the snapshot knows it.
    pub fn snapshot_enabled(&self, tool: &str) -> Option<bool> {
        self.tools.iter().find(|t| t.name == tool).map(|t| t.enabled)
    }

    /// Tools absent from the snapshot are enabled.
    pub fn is_tool_enabled(&self, tool: &str) -> bool {
        self.snapshot_enabled(tool).unwrap_or(true)
    }
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_document() {
        let yaml = r#"
enabled: true
servers:
  calc:
    type: subprocess
    command: mcp-echo-server
    args: ["--quiet"]
    env:
      CALC_KEY: secret
    tools:
      - name: add
        enabled: false
      - name: echo
  remote:
    type: http
    url: https://tools.example.com/mcp
    headers:
      Authorization: Bearer abc
    request_timeout_ms: 5000
    enabled: false
"#;

        let document = McpConfigDocument::from_yaml(yaml).unwrap();
        assert!(document.enabled);
        assert_eq!(document.servers.len(), 2);

        let calc = document.server("calc").unwrap();
        assert_eq!(calc.kind, TransportKind::Subprocess);
        assert_eq!(calc.command.as_deref(), Some("mcp-echo-server"));
        assert_eq!(calc.request_timeout_ms, 30_000);
        assert!(calc.enabled);
        assert_eq!(calc.snapshot_enabled("add"), Some(false));
        assert!(calc.is_tool_enabled("echo"));
        assert!(calc.is_tool_enabled("never-seen"));

        let remote = document.server("remote").unwrap();
        assert_eq!(remote.kind, TransportKind::Http);
        assert!(!remote.enabled);
        assert_eq!(remote.request_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_legacy_transport_names() {
        let yaml = r#"
servers:
  a:
    type: stdio
    command: node
  b:
    type: streamableHttp
    url: http://localhost:3000/mcp
  c:
    command: uvx
"#;

        let document = McpConfigDocument::from_yaml(yaml).unwrap();
        assert_eq!(document.servers["a"].kind, TransportKind::Subprocess);
        assert_eq!(document.servers["b"].kind, TransportKind::Http);
        assert_eq!(document.servers["c"].kind, TransportKind::Subprocess);
    }

    #[test]
    fn test_empty_document_defaults() {
        let document = McpConfigDocument::from_yaml("  \n").unwrap();
        assert!(document.enabled);
        assert!(document.servers.is_empty());
    }

    #[test]
    fn test_missing_switch_means_enabled() {
        let yaml = r#"
servers:
  calc:
    type: subprocess
    command: mcp-echo-server
"#;
        let document = McpConfigDocument::from_yaml(yaml).unwrap();
        assert!(document.enabled);
        assert!(document.servers["calc"].enabled);
    }

    #[test]
    fn test_validation() {
        assert!(ServerConfig::subprocess("node", vec![]).validate("ok").is_ok());
        assert!(ServerConfig::http("https://x.test/mcp").validate("ok").is_ok());

        let mut missing_command = ServerConfig::subprocess("", vec![]);
        assert!(missing_command.validate("bad").is_err());
        missing_command.command = None;
        assert!(missing_command.validate("bad").is_err());

        assert!(ServerConfig::http("ftp://x.test").validate("bad").is_err());
        assert!(ServerConfig::subprocess("node", vec![])
            .with_request_timeout_ms(0)
            .validate("bad")
            .is_err());
    }

    #[test]
    fn test_yaml_round_trip_keeps_snapshot() {
        let document = McpConfigDocument::default().with_server(
            "calc",
            ServerConfig::subprocess("calc", vec![])
                .with_tools(vec![ToolSnapshot::new("add", false)]),
        );

        let yaml = document.to_yaml().unwrap();
        assert!(yaml.contains("type: subprocess"));
        let parsed = McpConfigDocument::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, document);
    }
}

//! One live session with one configured server.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, error, info, warn};

use toolbridge_config::{ServerConfig, ToolSnapshot, TransportKind};
use toolbridge_core::{Result, ToolbridgeError};

use crate::transport::Transport;
use crate::types::{InitializeParams, InitializeResult, McpToolInfo, ToolCallParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    /// Bring-up failed; a fresh `connect` is needed.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A tool as discovered on a server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub server_name: String,
    pub enabled: bool,
}

impl McpTool {
    fn from_info(server: &str, info: McpToolInfo, snapshot: &[ToolSnapshot]) -> Self {
        let enabled = snapshot
            .iter()
            .find(|entry| entry.name == info.name)
            .map_or(true, |entry| entry.enabled);
        Self {
            description: info.description.unwrap_or_default(),
            input_schema: info.input_schema,
            server_name: server.to_string(),
            enabled,
            name: info.name,
        }
    }
}

/// Handshake, discovery and calls over one transport.
///
/// Requests are serialized: the next one is not written before the
/// previous one has been answered or has timed out.
pub struct Connection {
    server: String,
    config: ServerConfig,
    transport: Box<dyn Transport>,
    state: RwLock<ConnectionState>,
    tools: RwLock<Vec<McpTool>>,
    server_info: RwLock<Option<InitializeResult>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    request_lock: tokio::sync::Mutex<()>,
}

impl Connection {
    pub fn new(server: impl Into<String>, config: ServerConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            server: server.into(),
            config,
            transport,
            state: RwLock::new(ConnectionState::Disconnected),
            tools: RwLock::new(Vec::new()),
            server_info: RwLock::new(None),
            connected_at: RwLock::new(None),
            request_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("MCP server '{}' -> {}", self.server, state);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Ready && self.transport.is_healthy()
    }

    pub fn tools(&self) -> Vec<McpTool> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn server_info(&self) -> Option<InitializeResult> {
        self.server_info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.connected_at.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> Option<String> {
        self.transport.session_id()
    }

    /// Bring the transport up, handshake and discover tools.
    pub async fn connect(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.transport.connect().await {
            self.set_state(ConnectionState::Failed);
            return Err(match e {
                ToolbridgeError::ConnectFailed { .. } => e,
                other => ToolbridgeError::ConnectFailed {
                    server: self.server.clone(),
                    reason: other.to_string(),
                },
            });
        }

        self.set_state(ConnectionState::Handshaking);
        if let Err(e) = self.handshake().await {
            if let Err(close_err) = self.transport.disconnect().await {
                error!("Failed to close MCP server '{}' after handshake error: {}", self.server, close_err);
            }
            self.set_state(ConnectionState::Failed);
            return Err(ToolbridgeError::HandshakeFailed {
                server: self.server.clone(),
                reason: e.to_string(),
            });
        }

        *self.connected_at.write().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.set_state(ConnectionState::Ready);
        info!(
            "MCP server '{}' ready with {} tools",
            self.server,
            self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
        );
        Ok(())
    }

    async fn handshake(&self) -> Result<()> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let result = self.request("initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            ToolbridgeError::MalformedResponse {
                server: self.server.clone(),
                reason: format!("bad initialize result: {e}"),
            }
        })?;

        match &init.server_info {
            Some(info) => info!(
                "MCP server '{}' is {} v{} (protocol {})",
                self.server, info.name, info.version, init.protocol_version
            ),
            None => info!(
                "MCP server '{}' initialized (protocol {})",
                self.server, init.protocol_version
            ),
        }
        *self.server_info.write().unwrap_or_else(PoisonError::into_inner) = Some(init);

        {
            let _guard = self.request_lock.lock().await;
            self.transport
                .send_notification("notifications/initialized", None)
                .await?;
        }

        self.discover(&self.config.tools).await?;
        Ok(())
    }

    /// Run `tools/list` and replace the catalog. Enablement comes from
    /// `snapshot`; tools it does not mention are enabled.
    pub async fn discover(&self, snapshot: &[ToolSnapshot]) -> Result<Vec<McpTool>> {
        let result = self.request("tools/list", Some(json!({}))).await?;
        let entries = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut tools = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<McpToolInfo>(entry) {
                Ok(info) if !info.name.is_empty() => {
                    tools.push(McpTool::from_info(&self.server, info, snapshot));
                }
                Ok(_) | Err(_) => {
                    warn!("MCP server '{}' listed a tool without a usable name, skipping", self.server);
                }
            }
        }

        debug!("Discovered {} tools on MCP server '{}'", tools.len(), self.server);
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = tools.clone();
        Ok(tools)
    }

    /// Forward `tools/call`. Fails fast when the connection is unhealthy.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        if !self.is_healthy() {
            return Err(ToolbridgeError::Disconnected {
                server: self.server.clone(),
                reason: format!("connection is {}", self.state()),
            });
        }
        debug!("Calling MCP tool '{}' on server '{}'", name, self.server);
        let params = serde_json::to_value(ToolCallParams {
            name: name.to_string(),
            arguments,
        })?;
        self.request("tools/call", Some(params)).await
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let _guard = self.request_lock.lock().await;
        self.transport.send_request(method, params).await
    }

    /// Update the live enablement of one tool, or of all when `tool` is
    /// `None`. Returns how many records changed.
    pub fn set_tool_enabled(&self, tool: Option<&str>, enabled: bool) -> usize {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = 0;
        for record in tools.iter_mut() {
            if tool.map_or(true, |name| record.name == name) {
                record.enabled = enabled;
                updated += 1;
            }
        }
        updated
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.transport.disconnect().await {
            error!("Error disconnecting MCP server '{}': {}", self.server, e);
        }
        self.tools.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.set_state(ConnectionState::Disconnected);
        info!("MCP server '{}' disconnected", self.server);
    }
}

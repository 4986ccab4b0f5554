//! MCP client manager
//!
//! Owns one connection per enabled server, keeps the persisted tool
//! snapshot in step with the live catalog, and is the single place where
//! server configuration is read and written.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use toolbridge_config::{ConfigStore, McpConfigDocument, ServerConfig, ToolSnapshot, TransportKind};
use toolbridge_core::{Result, ToolbridgeError};

use crate::connection::{Connection, ConnectionState, McpTool};
use crate::transport::{DefaultTransportFactory, TransportFactory};
use crate::types::ServerInfo;

#[derive(Debug, Clone, Default, Serialize)]
pub struct InitializeReport {
    pub connected: Vec<String>,
    pub failed: Vec<ServerFailure>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerFailure {
    pub server: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerTestReport {
    pub success: bool,
    pub message: String,
    pub tools: Vec<McpTool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub kind: TransportKind,
    pub enabled: bool,
    pub state: ConnectionState,
    pub healthy: bool,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

pub struct ClientManager {
    store: Arc<dyn ConfigStore>,
    factory: Arc<dyn TransportFactory>,
    connections: RwLock<BTreeMap<String, Arc<Connection>>>,
    initialized: AtomicBool,
    /// Serializes initialize and shutdown.
    lifecycle: tokio::sync::Mutex<()>,
}

impl ClientManager {
    /// Real transports, with their I/O on a runtime owned by this manager.
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self::with_factory(store, Arc::new(DefaultTransportFactory::default()))
    }

    pub fn with_factory(store: Arc<dyn ConfigStore>, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            store,
            factory,
            connections: RwLock::new(BTreeMap::new()),
            initialized: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Connect every enabled server. Servers that fail are logged and left
    /// out; only an unreadable configuration is an error.
    pub async fn initialize(&self, force: bool) -> Result<InitializeReport> {
        let _guard = self.lifecycle.lock().await;

        if self.is_initialized() && !force {
            debug!("MCP client manager already initialized");
            return Ok(InitializeReport {
                connected: self.connection_names(),
                ..Default::default()
            });
        }

        self.disconnect_all().await;

        let document = self.store.load()?;
        let mut report = InitializeReport::default();

        if !document.enabled {
            info!("MCP is disabled in configuration, no servers connected");
            report.skipped = document.servers.keys().cloned().collect();
            self.initialized.store(true, Ordering::SeqCst);
            return Ok(report);
        }

        for (name, config) in &document.servers {
            if !config.enabled {
                debug!("Skipping disabled MCP server '{}'", name);
                report.skipped.push(name.clone());
                continue;
            }

            match self.open(name, config).await {
                Ok(connection) => {
                    self.connections
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(name.clone(), Arc::new(connection));
                    report.connected.push(name.clone());
                }
                Err(e) => {
                    warn!("MCP server '{}' unavailable: {}", name, e);
                    report.failed.push(ServerFailure {
                        server: name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(
            "MCP initialization complete: {} connected, {} failed, {} skipped",
            report.connected.len(),
            report.failed.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    async fn open(&self, name: &str, config: &ServerConfig) -> Result<Connection> {
        let transport = self.factory.create(name, config)?;
        let connection = Connection::new(name, config.clone(), transport);
        connection.connect().await?;
        Ok(connection)
    }

    /// Disconnect everything. Calling it again is harmless.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        self.disconnect_all().await;
        self.initialized.store(false, Ordering::SeqCst);
    }

    async fn disconnect_all(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut guard = self.connections.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard).into_values().collect()
        };
        if connections.is_empty() {
            return;
        }
        info!("Disconnecting {} MCP servers", connections.len());
        for connection in connections {
            connection.disconnect().await;
        }
    }

    /// Connect, list tools and disconnect, without touching live state.
    pub async fn test_server(&self, name: &str, config: &ServerConfig) -> ServerTestReport {
        let connection = match self.factory.create(name, config) {
            Ok(transport) => Connection::new(name, config.clone(), transport),
            Err(e) => {
                return ServerTestReport {
                    success: false,
                    message: format!("Invalid configuration: {e}"),
                    tools: Vec::new(),
                }
            }
        };

        let outcome = connection.connect().await;
        let tools = connection.tools();
        connection.disconnect().await;

        match outcome {
            Ok(()) => ServerTestReport {
                success: true,
                message: format!("Connected, found {} tools", tools.len()),
                tools,
            },
            Err(e) => ServerTestReport {
                success: false,
                message: format!("Connection failed: {e}"),
                tools: Vec::new(),
            },
        }
    }

    /// Merge discovered tools into the server's snapshot. Known tools keep
    /// their enablement, new ones are added and entries no longer offered
    /// by the server stay as they are.
    pub fn persist_discovered_tools(&self, server: &str, tools: &[McpTool]) -> Result<()> {
        self.store.update(&mut |document| {
            let config = document
                .servers
                .get_mut(server)
                .ok_or_else(|| ToolbridgeError::ServerNotFound(server.to_string()))?;

            for tool in tools {
                let description = (!tool.description.is_empty()).then(|| tool.description.clone());
                match config.tools.iter_mut().find(|entry| entry.name == tool.name) {
                    Some(entry) => entry.description = description,
                    None => config.tools.push(ToolSnapshot {
                        name: tool.name.clone(),
                        enabled: tool.enabled,
                        description,
                    }),
                }
            }
            Ok(())
        })?;
        info!("Saved {} discovered tools for MCP server '{}'", tools.len(), server);
        Ok(())
    }

    /// Tools of every ready connection.
    pub fn get_all_tools(&self) -> Vec<McpTool> {
        self.connections()
            .iter()
            .filter(|connection| connection.state() == ConnectionState::Ready)
            .flat_map(|connection| connection.tools())
            .collect()
    }

    /// Persist a new enablement for one tool (or all tools of a server when
    /// `tool` is `None`) and apply it to the live catalog.
    pub fn update_tool_enabled(&self, server: &str, tool: Option<&str>, enabled: bool) -> Result<usize> {
        let mut updated = 0;
        self.store.update(&mut |document| {
            let config = document
                .servers
                .get_mut(server)
                .ok_or_else(|| ToolbridgeError::ServerNotFound(server.to_string()))?;
            if config.tools.is_empty() {
                return Err(ToolbridgeError::NoToolSnapshot(server.to_string()));
            }

            updated = 0;
            for entry in config.tools.iter_mut() {
                if tool.map_or(true, |name| entry.name == name) {
                    entry.enabled = enabled;
                    updated += 1;
                }
            }
            match tool {
                Some(name) if updated == 0 => Err(ToolbridgeError::ToolNotFound {
                    server: server.to_string(),
                    tool: name.to_string(),
                }),
                _ => Ok(()),
            }
        })?;

        if let Some(connection) = self.connection(server) {
            connection.set_tool_enabled(tool, enabled);
        }

        info!(
            "{} {} on MCP server '{}'",
            if enabled { "Enabled" } else { "Disabled" },
            tool.map_or_else(|| format!("{updated} tools"), |name| format!("tool '{name}'")),
            server
        );
        Ok(updated)
    }

    /// Tool enablement as currently persisted. Falls back to the live
    /// record when the configuration cannot be read.
    pub fn is_tool_enabled(&self, server: &str, tool: &str) -> bool {
        match self.store.load() {
            Ok(document) => document
                .server(server)
                .map_or(true, |config| config.is_tool_enabled(tool)),
            Err(e) => {
                warn!("Could not read MCP configuration, using live state: {}", e);
                self.connection(server)
                    .and_then(|connection| {
                        connection
                            .tools()
                            .into_iter()
                            .find(|record| record.name == tool)
                            .map(|record| record.enabled)
                    })
                    .unwrap_or(true)
            }
        }
    }

    pub fn connection(&self, server: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
            .cloned()
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn connection_names(&self) -> Vec<String> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// One entry per configured server, plus any live connection whose
    /// server has since been removed from the configuration.
    pub fn status(&self) -> Result<Vec<ServerStatus>> {
        let document = self.store.load()?;
        let mut statuses = Vec::new();

        for (name, config) in &document.servers {
            statuses.push(self.describe(name, config.kind, config.enabled));
        }
        for connection in self.connections() {
            if !document.servers.contains_key(connection.server_name()) {
                statuses.push(self.describe(connection.server_name(), connection.kind(), true));
            }
        }
        Ok(statuses)
    }

    fn describe(&self, name: &str, kind: TransportKind, enabled: bool) -> ServerStatus {
        match self.connection(name) {
            Some(connection) => {
                let info = connection.server_info();
                ServerStatus {
                    name: name.to_string(),
                    kind,
                    enabled,
                    state: connection.state(),
                    healthy: connection.is_healthy(),
                    tool_count: connection.tools().len(),
                    server_info: info.as_ref().and_then(|i| i.server_info.clone()),
                    protocol_version: info.map(|i| i.protocol_version),
                    connected_at: connection.connected_at(),
                }
            }
            None => ServerStatus {
                name: name.to_string(),
                kind,
                enabled,
                state: ConnectionState::Disconnected,
                healthy: false,
                tool_count: 0,
                server_info: None,
                protocol_version: None,
                connected_at: None,
            },
        }
    }

    pub fn config(&self) -> Result<McpConfigDocument> {
        self.store.load()
    }

    /// Configuration safe to display.
    pub fn masked_config(&self) -> Result<McpConfigDocument> {
        Ok(self.store.load()?.masked())
    }

    /// Replace the whole document. Masked secrets are restored from the
    /// stored copy first.
    pub fn save_config(&self, document: McpConfigDocument) -> Result<()> {
        for (name, server) in &document.servers {
            server.validate(name)?;
        }
        self.store.update(&mut |stored| {
            let mut incoming = document.clone();
            incoming.restore_masked(stored);
            *stored = incoming;
            Ok(())
        })?;
        Ok(())
    }

    /// Add or replace a single server definition.
    pub fn save_server(&self, name: &str, config: ServerConfig) -> Result<()> {
        config.validate(name)?;
        self.store.update(&mut |stored| {
            let mut incoming = config.clone();
            if let Some(existing) = stored.servers.get(name) {
                incoming.restore_masked(existing);
            }
            stored.servers.insert(name.to_string(), incoming);
            Ok(())
        })?;
        info!("Saved configuration for MCP server '{}'", name);
        Ok(())
    }

    /// Re-run discovery on every ready connection with the current
    /// snapshot. Failures are logged and the old catalog is kept.
    pub async fn rediscover(&self) -> Result<usize> {
        let document = self.store.load()?;
        let mut total = 0;
        for connection in self.connections() {
            if !connection.is_healthy() {
                continue;
            }
            let snapshot = document
                .server(connection.server_name())
                .map(|config| config.tools.clone())
                .unwrap_or_default();
            match connection.discover(&snapshot).await {
                Ok(tools) => total += tools.len(),
                Err(e) => {
                    warn!(
                        "Rediscovery on MCP server '{}' failed: {}",
                        connection.server_name(),
                        e
                    );
                    total += connection.tools().len();
                }
            }
        }
        Ok(total)
    }
}

//! Wiring between the client manager and the tool registry: remote tools
//! become registry entries next to native ones.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use toolbridge_config::ConfigStore;
use toolbridge_core::Result;
use toolbridge_tools::{RemoteToolSource, Tool, ToolRegistry};

use crate::adapter::McpToolAdapter;
use crate::manager::{ClientManager, InitializeReport};
use crate::transport::TransportFactory;

/// Feeds the registry with adapters for every enabled remote tool.
pub struct McpToolSource {
    manager: Arc<ClientManager>,
}

impl McpToolSource {
    pub fn new(manager: Arc<ClientManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl RemoteToolSource for McpToolSource {
    async fn discover(&self) -> Result<Vec<Arc<dyn Tool>>> {
        self.manager.rediscover().await?;

        let mut adapters: Vec<Arc<dyn Tool>> = Vec::new();
        for tool in self.manager.get_all_tools() {
            if !tool.enabled {
                debug!("Not exposing disabled MCP tool {}/{}", tool.server_name, tool.name);
                continue;
            }
            adapters.push(Arc::new(McpToolAdapter::new(&tool, Arc::clone(&self.manager))));
        }
        Ok(adapters)
    }
}

/// Everything an agent loop needs: the client manager and the merged
/// registry, wired together.
pub struct ToolContext {
    manager: Arc<ClientManager>,
    registry: Arc<ToolRegistry>,
}

impl ToolContext {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self::from_manager(ClientManager::new(store))
    }

    pub fn with_factory(store: Arc<dyn ConfigStore>, factory: Arc<dyn TransportFactory>) -> Self {
        Self::from_manager(ClientManager::with_factory(store, factory))
    }

    fn from_manager(manager: ClientManager) -> Self {
        let manager = Arc::new(manager);
        let registry = Arc::new(ToolRegistry::new());
        registry.set_remote_source(Arc::new(McpToolSource::new(Arc::clone(&manager))));
        Self { manager, registry }
    }

    pub fn manager(&self) -> &Arc<ClientManager> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn register_native(&self, tool: impl Tool + 'static) -> Result<()> {
        self.registry.register_native(tool)
    }

    /// Connect configured servers and expose their tools.
    pub async fn start(&self) -> Result<InitializeReport> {
        let report = self.manager.initialize(false).await?;
        let count = self.registry.refresh_mcp_tools().await?;
        info!(
            "Tool context ready: {} servers, {} remote tools, {} tools total",
            report.connected.len(),
            count,
            self.registry.list().len()
        );
        Ok(report)
    }

    pub async fn refresh_mcp_tools(&self) -> Result<usize> {
        self.registry.refresh_mcp_tools().await
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        self.registry.set_remote_tools(Vec::new());
    }
}

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use toolbridge_core::{Result, ToolOutcome, ToolbridgeError};
use tracing::{debug, info, warn};

pub mod bridge;

pub use bridge::BlockingBridge;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> Value;

    /// `Err` is reserved for failures the caller should see as its own
    /// (bad arguments, unknown tool); remote trouble arrives as an outcome.
    async fn execute(&self, args: Value) -> Result<ToolOutcome>;
}

/// Supplies the remote half of the registry.
#[async_trait]
pub trait RemoteToolSource: Send + Sync {
    /// Run discovery again and return the tools that should be callable.
    async fn discover(&self) -> Result<Vec<Arc<dyn Tool>>>;
}

#[derive(Default)]
struct Catalog {
    native: BTreeMap<String, Arc<dyn Tool>>,
    remote: BTreeMap<String, Arc<dyn Tool>>,
}

/// Native tools plus adapted remote tools, addressable by name.
///
/// Native names win: a remote tool that collides with one is dropped.
pub struct ToolRegistry {
    catalog: Arc<RwLock<Catalog>>,
    source: RwLock<Option<Arc<dyn RemoteToolSource>>>,
    bridge: Arc<BlockingBridge>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_bridge(BlockingBridge::default())
    }

    pub fn with_bridge(bridge: BlockingBridge) -> Self {
        Self {
            catalog: Arc::new(RwLock::new(Catalog::default())),
            source: RwLock::new(None),
            bridge: Arc::new(bridge),
        }
    }

    pub fn register_native(&self, tool: impl Tool + 'static) -> Result<()> {
        self.register_native_arc(Arc::new(tool))
    }

    pub fn register_native_arc(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        let name = tool.name().to_string();
        if catalog.native.contains_key(&name) {
            return Err(ToolbridgeError::DuplicateTool(name));
        }
        if catalog.remote.remove(&name).is_some() {
            warn!("Native tool '{}' shadows a remote tool of the same name", name);
        }
        debug!("Registered native tool '{}'", name);
        catalog.native.insert(name, tool);
        Ok(())
    }

    pub fn set_remote_source(&self, source: Arc<dyn RemoteToolSource>) {
        *self.source.write().unwrap_or_else(PoisonError::into_inner) = Some(source);
    }

    /// Replace the whole remote half of the catalog.
    pub fn set_remote_tools(&self, tools: Vec<Arc<dyn Tool>>) {
        let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        let mut remote = BTreeMap::new();
        for tool in tools {
            let name = tool.name().to_string();
            if catalog.native.contains_key(&name) {
                warn!("Dropping remote tool '{}': name is taken by a native tool", name);
                continue;
            }
            if remote.insert(name.clone(), tool).is_some() {
                warn!("Remote tool '{}' was offered twice, keeping the last", name);
            }
        }
        catalog.remote = remote;
    }

    /// Ask the remote source for a fresh set of tools and swap them in.
    /// Returns the number of remote tools now registered.
    pub async fn refresh_mcp_tools(&self) -> Result<usize> {
        let source = self
            .source
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(source) = source else {
            debug!("No remote tool source configured, nothing to refresh");
            return Ok(0);
        };

        let tools = source.discover().await?;
        self.set_remote_tools(tools);
        let count = self.remote_count();
        info!("Registered {} remote tools", count);
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        catalog
            .native
            .get(name)
            .or_else(|| catalog.remote.get(name))
            .cloned()
    }

    /// Names, natives first.
    pub fn list(&self) -> Vec<String> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        catalog
            .native
            .keys()
            .chain(catalog.remote.keys())
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<dyn Tool>> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        catalog
            .native
            .values()
            .chain(catalog.remote.values())
            .cloned()
            .collect()
    }

    pub fn remote_count(&self) -> usize {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .remote
            .len()
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<ToolOutcome> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolbridgeError::UnknownTool(name.to_string()))?;
        tool.execute(args).await
    }

    /// Synchronous form of [`execute`](Self::execute).
    ///
    /// Fails with [`ToolbridgeError::BlockingCall`] when no result arrives
    /// within the bridge's wait, or at once when every bridge worker is busy
    /// and the queue is full. Callers making bursts of calls should retry.
    pub fn call_blocking(&self, name: &str, args: Value) -> Result<ToolOutcome> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolbridgeError::UnknownTool(name.to_string()))?;
        self.bridge.run(async move { tool.execute(args).await })?
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use serde_json::json;

    struct StaticTool {
        name: String,
        reply: String,
    }

    impl StaticTool {
        fn new(name: &str, reply: &str) -> Self {
            Self {
                name: name.to_string(),
                reply: reply.to_string(),
            }
        }
    }

    #[async_trait]
    impl Tool for StaticTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "Returns a fixed reply"
        }

        fn schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {}
            })
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutcome> {
            Ok(ToolOutcome::success(self.reply.clone()))
        }
    }

    mock! {
        Source {}

        #[async_trait]
        impl RemoteToolSource for Source {
            async fn discover(&self) -> Result<Vec<Arc<dyn Tool>>>;
        }
    }

    #[test]
    fn test_duplicate_native_rejected() {
        let registry = ToolRegistry::new();
        registry.register_native(StaticTool::new("clock", "noon")).unwrap();

        let err = registry
            .register_native(StaticTool::new("clock", "midnight"))
            .unwrap_err();
        assert!(matches!(err, ToolbridgeError::DuplicateTool(name) if name == "clock"));
        assert_eq!(registry.list(), vec!["clock".to_string()]);
    }

    #[test]
    fn test_remote_collision_is_dropped() {
        let registry = ToolRegistry::new();
        registry.register_native(StaticTool::new("calc_add", "native")).unwrap();

        registry.set_remote_tools(vec![
            Arc::new(StaticTool::new("calc_add", "remote")),
            Arc::new(StaticTool::new("calc_echo", "remote")),
        ]);

        assert_eq!(
            registry.list(),
            vec!["calc_add".to_string(), "calc_echo".to_string()]
        );
        assert_eq!(registry.remote_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_replaces_remote_half() {
        let registry = ToolRegistry::new();
        registry.register_native(StaticTool::new("native", "n")).unwrap();

        let mut source = MockSource::new();
        let mut round = 0;
        source.expect_discover().times(2).returning(move || {
            round += 1;
            let name = if round == 1 { "remote_a" } else { "remote_b" };
            Ok(vec![Arc::new(StaticTool::new(name, "r")) as Arc<dyn Tool>])
        });
        registry.set_remote_source(Arc::new(source));

        assert_eq!(registry.refresh_mcp_tools().await.unwrap(), 1);
        assert!(registry.get("remote_a").is_some());

        assert_eq!(registry.refresh_mcp_tools().await.unwrap(), 1);
        assert!(registry.get("remote_a").is_none());
        assert!(registry.get("remote_b").is_some());
        assert!(registry.get("native").is_some());
    }

    #[tokio::test]
    async fn test_refresh_without_source() {
        let registry = ToolRegistry::new();
        assert_eq!(registry.refresh_mcp_tools().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.execute("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolbridgeError::UnknownTool(_)));
    }

    #[test]
    fn test_call_blocking_without_runtime() {
        let registry = ToolRegistry::new();
        registry.register_native(StaticTool::new("clock", "noon")).unwrap();

        let outcome = registry.call_blocking("clock", json!({})).unwrap();
        assert_eq!(outcome.text(), "noon");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_call_blocking_inside_runtime() {
        let registry = ToolRegistry::new();
        registry.register_native(StaticTool::new("clock", "noon")).unwrap();

        let outcome = registry.call_blocking("clock", json!({})).unwrap();
        assert!(outcome.is_success());
    }
}

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use toolbridge_config::{McpConfigDocument, ServerConfig, ToolSnapshot, TransportKind};
use toolbridge_core::{Result, ToolbridgeError};
use toolbridge_mcp::{Transport, TransportFactory};

/// Scripted server behind a fake transport, shared with the test so it can
/// count calls and inspect ordering.
pub struct FakeServer {
    pub tools: Mutex<Vec<Value>>,
    pub call_delay: Duration,
    pub fail_connect: bool,
    pub tool_calls: AtomicUsize,
    pub events: Mutex<Vec<String>>,
    healthy: AtomicBool,
}

impl FakeServer {
    pub fn new(tool_names: &[&str]) -> Arc<Self> {
        Self::build(tool_names, Duration::ZERO, false)
    }

    pub fn slow(tool_names: &[&str], call_delay: Duration) -> Arc<Self> {
        Self::build(tool_names, call_delay, false)
    }

    pub fn unreachable() -> Arc<Self> {
        Self::build(&[], Duration::ZERO, true)
    }

    fn build(tool_names: &[&str], call_delay: Duration, fail_connect: bool) -> Arc<Self> {
        let tools = tool_names
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "description": format!("The {name} tool"),
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "a": {"type": "integer"},
                            "b": {"type": "integer"}
                        }
                    }
                })
            })
            .collect();
        Arc::new(Self {
            tools: Mutex::new(tools),
            call_delay,
            fail_connect,
            tool_calls: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(false),
        })
    }

    pub fn tool_calls(&self) -> usize {
        self.tool_calls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn is_up(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

pub struct FakeTransport {
    name: String,
    server: Arc<FakeServer>,
}

#[async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Subprocess
    }

    async fn connect(&self) -> Result<()> {
        if self.server.fail_connect {
            return Err(ToolbridgeError::ConnectFailed {
                server: self.name.clone(),
                reason: "connection refused".into(),
            });
        }
        self.server.healthy.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.server.healthy.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "serverInfo": {"name": self.name, "version": "1.0.0"}
            })),
            "tools/list" => Ok(json!({"tools": self.server.tools.lock().unwrap().clone()})),
            "tools/call" => {
                let n = self.server.tool_calls.fetch_add(1, Ordering::SeqCst) + 1;
                let params = params.unwrap_or_default();
                let args = params.get("arguments").cloned().unwrap_or_default();
                let tag = args
                    .get("a")
                    .and_then(Value::as_i64)
                    .map_or_else(|| n.to_string(), |a| a.to_string());

                self.server.events.lock().unwrap().push(format!("write:{tag}"));
                tokio::time::sleep(self.server.call_delay).await;
                self.server.events.lock().unwrap().push(format!("read:{tag}"));

                let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!({"content": [{"type": "text", "text": (a + b).to_string()}]}))
            }
            other => Err(ToolbridgeError::Rpc {
                server: self.name.clone(),
                code: -32601,
                message: format!("method not found: {other}"),
            }),
        }
    }

    async fn send_notification(&self, _method: &str, _params: Option<Value>) -> Result<()> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.server.healthy.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeFactory {
    servers: Mutex<HashMap<String, Arc<FakeServer>>>,
    pub created: AtomicUsize,
}

impl FakeFactory {
    pub fn with(servers: &[(&str, Arc<FakeServer>)]) -> Arc<Self> {
        let factory = Self::default();
        {
            let mut map = factory.servers.lock().unwrap();
            for (name, server) in servers {
                map.insert(name.to_string(), Arc::clone(server));
            }
        }
        Arc::new(factory)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl TransportFactory for FakeFactory {
    fn create(&self, server: &str, _config: &ServerConfig) -> Result<Box<dyn Transport>> {
        let fake = self
            .servers
            .lock()
            .unwrap()
            .get(server)
            .cloned()
            .ok_or_else(|| ToolbridgeError::Config(format!("no fake for '{server}'")))?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTransport {
            name: server.to_string(),
            server: fake,
        }))
    }
}

pub fn server_config(snapshot: &[(&str, bool)]) -> ServerConfig {
    ServerConfig::subprocess("fake-server", vec![]).with_tools(
        snapshot
            .iter()
            .map(|(name, enabled)| ToolSnapshot::new(*name, *enabled))
            .collect(),
    )
}

pub fn document(servers: Vec<(&str, ServerConfig)>) -> McpConfigDocument {
    servers
        .into_iter()
        .fold(McpConfigDocument::default(), |doc, (name, config)| {
            doc.with_server(name, config)
        })
}

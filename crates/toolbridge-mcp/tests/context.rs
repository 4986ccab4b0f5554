mod common;

use async_trait::async_trait;
use common::{document, server_config, FakeFactory, FakeServer};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use toolbridge_config::{MemoryConfigStore, ServerConfig};
use toolbridge_core::{Result, ToolOutcome, ToolbridgeError};
use toolbridge_mcp::ToolContext;
use toolbridge_tools::{BlockingBridge, Tool};

struct LocalAdd;

#[async_trait]
impl Tool for LocalAdd {
    fn name(&self) -> &str {
        "calc_add"
    }

    fn description(&self) -> &str {
        "Local adder"
    }

    fn schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _args: Value) -> Result<ToolOutcome> {
        Ok(ToolOutcome::success("local"))
    }
}

fn context(snapshot: &[(&str, bool)]) -> (ToolContext, Arc<FakeServer>) {
    let calc = FakeServer::new(&["add", "echo", "mul"]);
    let factory = FakeFactory::with(&[("calc", calc.clone())]);
    let store = Arc::new(MemoryConfigStore::new(document(vec![(
        "calc",
        server_config(snapshot),
    )])));
    (ToolContext::with_factory(store, factory), calc)
}

#[tokio::test]
async fn test_start_merges_native_and_remote_tools() {
    let (ctx, _calc) = context(&[("mul", false)]);
    ctx.register_native(LocalAdd).unwrap();

    let report = ctx.start().await.unwrap();
    assert_eq!(report.connected, vec!["calc".to_string()]);

    // The native tool keeps its name; the disabled tool is not exposed.
    assert_eq!(ctx.registry().list(), vec!["calc_add", "calc_echo"]);
    assert_eq!(ctx.registry().remote_count(), 1);

    let outcome = ctx.registry().execute("calc_add", json!({})).await.unwrap();
    assert_eq!(outcome.text(), "local");

    let unknown = ctx.registry().execute("calc_mul", json!({})).await;
    assert!(matches!(unknown, Err(ToolbridgeError::UnknownTool(_))));

    ctx.shutdown().await;
    assert_eq!(ctx.registry().list(), vec!["calc_add"]);
}

#[tokio::test]
async fn test_refresh_picks_up_enablement_changes() {
    let (ctx, calc) = context(&[("add", true), ("echo", true), ("mul", true)]);
    ctx.start().await.unwrap();
    assert_eq!(ctx.registry().remote_count(), 3);

    ctx.manager().update_tool_enabled("calc", Some("mul"), false).unwrap();
    assert_eq!(ctx.refresh_mcp_tools().await.unwrap(), 2);
    assert!(ctx.registry().get("calc_mul").is_none());

    let outcome = ctx
        .registry()
        .execute("calc_add", json!({"a": "2", "b": 5}))
        .await
        .unwrap();
    assert_eq!(outcome.text(), "7");
    assert_eq!(calc.tool_calls(), 1);
}

#[tokio::test]
async fn test_invalid_arguments_never_reach_the_server() {
    let (ctx, calc) = context(&[]);
    ctx.start().await.unwrap();

    let result = ctx
        .registry()
        .execute("calc_add", json!({"a": "two"}))
        .await;
    assert!(matches!(result, Err(ToolbridgeError::InvalidArguments { .. })));
    assert_eq!(calc.tool_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_blocking_inside_runtime() {
    let (ctx, calc) = context(&[]);
    ctx.start().await.unwrap();

    let outcome = ctx
        .registry()
        .call_blocking("calc_add", json!({"a": 3, "b": 4}))
        .unwrap();
    assert_eq!(outcome.text(), "7");
    assert_eq!(calc.tool_calls(), 1);

    ctx.shutdown().await;
}

#[test]
fn test_call_blocking_without_runtime() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (ctx, _calc) = context(&[]);
    runtime.block_on(ctx.start()).unwrap();

    let outcome = ctx
        .registry()
        .call_blocking("calc_add", json!({"a": 10, "b": 5}))
        .unwrap();
    assert_eq!(outcome.text(), "15");

    let unknown = ctx.registry().call_blocking("calc_nope", json!({}));
    assert!(matches!(unknown, Err(ToolbridgeError::UnknownTool(_))));

    runtime.block_on(ctx.shutdown());
}

/// The default test runtime is current-thread and stays blocked for the
/// whole call, so the echo server's pipes must be driven elsewhere.
#[tokio::test]
async fn test_call_blocking_from_current_thread_runtime() {
    let config = ServerConfig::subprocess(env!("CARGO_BIN_EXE_mcp-echo-server"), vec![])
        .with_request_timeout_ms(5_000);
    let store = Arc::new(MemoryConfigStore::new(document(vec![("echo", config)])));
    let ctx = ToolContext::new(store);
    let report = ctx.start().await.unwrap();
    assert_eq!(report.connected, vec!["echo".to_string()]);

    let started = Instant::now();
    let outcome = ctx
        .registry()
        .call_blocking("echo_add", json!({"a": 2, "b": 3}))
        .unwrap();
    assert_eq!(outcome.text(), "5");

    let tool = ctx.registry().get("echo_add").unwrap();
    let bridge = BlockingBridge::new(2, Duration::from_secs(10));
    let outcome = bridge
        .run(async move { tool.execute(json!({"a": 20, "b": 22})).await })
        .unwrap()
        .unwrap();
    assert_eq!(outcome.text(), "42");
    assert!(started.elapsed() < Duration::from_secs(5));

    ctx.shutdown().await;
}

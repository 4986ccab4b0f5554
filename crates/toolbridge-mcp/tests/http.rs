//! HTTP transport against an in-process axum server.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use toolbridge_config::ServerConfig;
use toolbridge_core::ToolbridgeError;
use toolbridge_mcp::{normalize_result, Connection, ConnectionState, HttpTransport, IoRuntime};
use toolbridge_tools::BlockingBridge;

const SESSION: &str = "session-123";

#[derive(Default)]
struct Seen {
    /// (method, session header, api key header) per request.
    requests: Mutex<Vec<(String, Option<String>, Option<String>)>>,
}

impl Seen {
    fn session_for(&self, method: &str) -> Option<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .find(|(m, _, _)| m == method)
            .and_then(|(_, session, _)| session.clone())
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

async fn handle(State(seen): State<Arc<Seen>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let method = body["method"].as_str().unwrap_or_default().to_string();
    let session = header_value(&headers, "mcp-session-id");
    seen.requests.lock().unwrap().push((
        method.clone(),
        session.clone(),
        header_value(&headers, "x-api-key"),
    ));
    let id = body.get("id").cloned().unwrap_or(Value::Null);

    match method.as_str() {
        "initialize" => (
            [("mcp-session-id", SESSION)],
            Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock-http", "version": "0.1.0"}
                }
            })),
        )
            .into_response(),

        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),

        "tools/list" => {
            let result = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"tools": [
                    {"name": "add", "description": "Add", "inputSchema": {"type": "object"}},
                    {"name": "boom", "inputSchema": {"type": "object"}}
                ]}
            });
            let body = format!(
                ": keep-alive\n\n\
                 event: message\ndata: {{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{{}}}}\n\n\
                 : keep-alive\n\n\
                 event: message\ndata: {result}\n\n"
            );
            ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
        }

        "tools/call" => {
            if session.as_deref() != Some(SESSION) {
                return (StatusCode::BAD_REQUEST, "missing session").into_response();
            }
            match body["params"]["name"].as_str().unwrap_or_default() {
                "add" => {
                    let args = &body["params"]["arguments"];
                    let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
                    Json(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {"content": [{"type": "text", "text": sum.to_string()}]}
                    }))
                    .into_response()
                }
                "boom" => (StatusCode::INTERNAL_SERVER_ERROR, "internal failure").into_response(),
                "garbage" => "this is not json".into_response(),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    StatusCode::NO_CONTENT.into_response()
                }
                _ => Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32602, "message": "unknown tool"}
                }))
                .into_response(),
            }
        }

        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn spawn_server() -> (String, Arc<Seen>) {
    let seen = Arc::new(Seen::default());
    let app = Router::new()
        .route("/mcp", post(handle))
        .with_state(Arc::clone(&seen));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/mcp"), seen)
}

/// Serve from a thread of its own so the server keeps answering while the
/// test's runtime is blocked.
fn spawn_server_thread() -> String {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let (url, _seen) = spawn_server().await;
            tx.send(url).unwrap();
            std::future::pending::<()>().await;
        });
    });
    rx.recv().unwrap()
}

async fn connect(config: ServerConfig) -> Connection {
    let transport = HttpTransport::from_config("remote", &config).unwrap();
    let connection = Connection::new("remote", config, Box::new(transport));
    connection.connect().await.unwrap();
    connection
}

#[tokio::test]
async fn test_handshake_over_http_and_event_stream() {
    let (url, seen) = spawn_server().await;
    let connection = connect(ServerConfig::http(url).with_header("X-Api-Key", "k-1")).await;

    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(connection.session_id().as_deref(), Some(SESSION));

    let names: Vec<String> = connection.tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["add".to_string(), "boom".to_string()]);

    assert_eq!(seen.session_for("initialize"), None);
    assert_eq!(seen.session_for("notifications/initialized").as_deref(), Some(SESSION));
    assert_eq!(seen.session_for("tools/list").as_deref(), Some(SESSION));
    assert!(seen
        .requests
        .lock()
        .unwrap()
        .iter()
        .all(|(_, _, key)| key.as_deref() == Some("k-1")));

    connection.disconnect().await;
    assert_eq!(connection.session_id(), None);
}

#[tokio::test]
async fn test_calls_carry_the_session() {
    let (url, seen) = spawn_server().await;
    let connection = connect(ServerConfig::http(url)).await;

    let result = connection.call_tool("add", json!({"a": 2, "b": 3})).await.unwrap();
    assert_eq!(normalize_result(result).text(), "5");
    assert_eq!(seen.session_for("tools/call").as_deref(), Some(SESSION));

    let unknown = connection.call_tool("missing", json!({})).await;
    assert!(matches!(unknown, Err(ToolbridgeError::Rpc { code: -32602, .. })));
}

#[tokio::test]
async fn test_http_errors_are_soft() {
    let (url, _seen) = spawn_server().await;
    let connection = connect(ServerConfig::http(url)).await;

    let err = connection.call_tool("boom", json!({})).await.unwrap_err();
    match &err {
        ToolbridgeError::Http { status, body, .. } => {
            assert_eq!(*status, 500);
            assert_eq!(body, "internal failure");
        }
        other => panic!("expected HTTP error, got {other:?}"),
    }
    assert!(err.is_soft());
    assert!(connection.is_healthy());

    let garbage = connection.call_tool("garbage", json!({})).await;
    assert!(matches!(garbage, Err(ToolbridgeError::MalformedResponse { .. })));

    let result = connection.call_tool("add", json!({"a": 1, "b": 1})).await.unwrap();
    assert_eq!(normalize_result(result).text(), "2");
}

#[tokio::test]
async fn test_request_timeout() {
    let (url, _seen) = spawn_server().await;
    let connection = connect(ServerConfig::http(url).with_request_timeout_ms(300)).await;

    let result = connection.call_tool("hang", json!({})).await;
    assert!(matches!(
        result,
        Err(ToolbridgeError::Timeout { timeout_ms: 300, .. })
    ));
    assert!(connection.is_healthy());
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_handshake() {
    let config = ServerConfig::http("http://127.0.0.1:9/mcp").with_request_timeout_ms(2_000);
    let transport = HttpTransport::from_config("remote", &config).unwrap();
    let connection = Connection::new("remote", config, Box::new(transport));

    let result = connection.connect().await;
    assert!(matches!(result, Err(ToolbridgeError::HandshakeFailed { .. })));
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert!(!connection.is_healthy());
}

#[tokio::test]
async fn test_blocking_call_from_current_thread_runtime() {
    let io = IoRuntime::new(1);
    let config = ServerConfig::http(spawn_server_thread());
    let transport = HttpTransport::from_config("remote", &config)
        .unwrap()
        .with_io(io.handle().unwrap());
    let connection = Arc::new(Connection::new("remote", config, Box::new(transport)));
    connection.connect().await.unwrap();

    let bridge = BlockingBridge::new(1, Duration::from_secs(10));
    let calling = Arc::clone(&connection);
    let result = bridge
        .run(async move { calling.call_tool("add", json!({"a": 2, "b": 3})).await })
        .unwrap()
        .unwrap();
    assert_eq!(normalize_result(result).text(), "5");

    connection.disconnect().await;
}

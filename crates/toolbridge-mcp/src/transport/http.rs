//! HTTP transport: one POST per message, answered with plain JSON or with
//! an event stream that carries the response among other events.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use toolbridge_config::{env_substitution, ServerConfig, TransportKind};
use toolbridge_core::{Result, ToolbridgeError};

use super::{on_io, Transport};
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, SESSION_HEADER};

const ACCEPT_VALUE: &str = "application/json, text/event-stream";

/// HTTP transport for MCP servers behind a single endpoint URL
pub struct HttpTransport {
    server: String,
    url: String,
    headers: BTreeMap<String, String>,
    timeout: Duration,

    client: tokio::sync::Mutex<Option<reqwest::Client>>,
    session_id: Arc<Mutex<Option<String>>>,
    connected: AtomicBool,
    io: Option<Handle>,
}

/// Everything one exchange needs, detached from the transport so it can
/// run as its own task.
struct Endpoint {
    server: String,
    url: String,
    client: reqwest::Client,
    session_id: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("server", &self.server)
            .field("url", &self.url)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(
        server: impl Into<String>,
        url: impl Into<String>,
        headers: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            server: server.into(),
            url: url.into(),
            headers,
            timeout,
            client: tokio::sync::Mutex::new(None),
            session_id: Arc::new(Mutex::new(None)),
            connected: AtomicBool::new(false),
            io: None,
        }
    }

    /// Run requests and their connections on `handle` instead of the
    /// caller's runtime.
    pub fn with_io(mut self, handle: Handle) -> Self {
        self.io = Some(handle);
        self
    }

    pub fn from_config(server: &str, config: &ServerConfig) -> Result<Self> {
        let url = config.url.clone().ok_or_else(|| {
            ToolbridgeError::Config(format!("Server '{server}' is missing 'url'"))
        })?;
        Ok(Self::new(
            server,
            url,
            config.headers.clone(),
            config.request_timeout(),
        ))
    }

    fn connect_error(&self, reason: impl Into<String>) -> ToolbridgeError {
        ToolbridgeError::ConnectFailed {
            server: self.server.clone(),
            reason: reason.into(),
        }
    }

    fn build_headers(&self) -> Result<HeaderMap> {
        let resolved = env_substitution::substitute_map(&self.headers)
            .map_err(|e| self.connect_error(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &resolved {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| self.connect_error(format!("invalid header name '{key}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| self.connect_error(format!("invalid header value for '{key}': {e}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn endpoint(&self) -> Result<Endpoint> {
        let client = self
            .client
            .lock()
            .await
            .clone()
            .ok_or_else(|| ToolbridgeError::Disconnected {
                server: self.server.clone(),
                reason: "transport is not connected".to_string(),
            })?;
        Ok(Endpoint {
            server: self.server.clone(),
            url: self.url.clone(),
            client,
            session_id: Arc::clone(&self.session_id),
        })
    }

    fn timed_out(&self, method: &str) -> ToolbridgeError {
        warn!("Request '{}' to MCP server '{}' timed out", method, self.server);
        ToolbridgeError::Timeout {
            server: self.server.clone(),
            method: method.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

impl Endpoint {
    fn malformed(&self, reason: impl Into<String>) -> ToolbridgeError {
        ToolbridgeError::MalformedResponse {
            server: self.server.clone(),
            reason: reason.into(),
        }
    }

    fn session(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// POST one envelope, remembering any session id the server assigns.
    async fn post(&self, body: &impl serde::Serialize) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, ACCEPT_VALUE)
            .json(body);
        if let Some(session) = self.session() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(|e| ToolbridgeError::Disconnected {
            server: self.server.clone(),
            reason: format!("request to {} failed: {e}", self.url),
        })?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut guard = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.as_deref() != Some(session) {
                debug!("MCP server '{}' assigned session {}", self.server, session);
                *guard = Some(session.to_string());
            }
        }

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            warn!("MCP server '{}' answered HTTP {}", self.server, status.as_u16());
            return Err(ToolbridgeError::Http {
                server: self.server.clone(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    async fn exchange(&self, request: &JsonRpcRequest) -> Result<Value> {
        let response = self.post(request).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        let message = if content_type.contains("text/event-stream") {
            self.scan_event_stream(response, &request.id).await?
        } else {
            let body = response
                .text()
                .await
                .map_err(|e| self.malformed(format!("failed to read body: {e}")))?;
            serde_json::from_str(&body).map_err(|_| {
                self.malformed(format!(
                    "unexpected response (content type '{content_type}'): {}",
                    truncate(&body, 200)
                ))
            })?
        };

        JsonRpcResponse::from_value(&self.server, message)?.into_result(&self.server)
    }

    /// Read `data:` fields as they arrive and stop at the first one that
    /// answers `id`. The rest of the stream is dropped unread.
    async fn scan_event_stream(&self, response: reqwest::Response, id: &RequestId) -> Result<Value> {
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.malformed(format!("event stream broke: {e}")))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(message) = self.parse_data_line(&line, id) {
                    return Ok(message);
                }
            }
        }

        if let Some(message) = self.parse_data_line(&buffer, id) {
            return Ok(message);
        }
        Err(self.malformed("event stream ended without a response"))
    }

    fn parse_data_line(&self, line: &[u8], id: &RequestId) -> Option<Value> {
        let line = String::from_utf8_lossy(line);
        let data = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?.trim();
        if data.is_empty() {
            return None;
        }

        match serde_json::from_str::<Value>(data) {
            Ok(message) if is_terminal(&message, id) => Some(message),
            Ok(_) => {
                debug!("Skipping event from MCP server '{}': {}", self.server, data);
                None
            }
            Err(_) => {
                debug!("Non-JSON event data from MCP server '{}': {}", self.server, data);
                None
            }
        }
    }
}

/// An event ends the scan when it carries our id or any result or error.
fn is_terminal(message: &Value, id: &RequestId) -> bool {
    let Some(object) = message.as_object() else {
        return false;
    };
    let id_matches = object
        .get("id")
        .and_then(|raw| serde_json::from_value::<RequestId>(raw.clone()).ok())
        .is_some_and(|found| &found == id);
    id_matches || object.contains_key("result") || object.contains_key("error")
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn connect(&self) -> Result<()> {
        let headers = self.build_headers()?;
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| self.connect_error(format!("failed to build HTTP client: {e}")))?;

        info!("Using MCP server '{}' over HTTP: {}", self.server, self.url);
        *self.client.lock().await = Some(client);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.client.lock().await.take();
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let endpoint = self.endpoint().await?;
        let id = RequestId::String(Uuid::new_v4().to_string());
        let request = JsonRpcRequest::new(id, method, params);
        debug!("Sending '{}' to MCP server '{}'", method, self.server);

        let timeout = self.timeout;
        let exchange = async move {
            let answered = tokio::time::timeout(timeout, endpoint.exchange(&request)).await;
            Ok::<_, ToolbridgeError>(answered.ok())
        };
        match on_io(self.io.as_ref(), &self.server, exchange).await? {
            Some(result) => result,
            None => Err(self.timed_out(method)),
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let endpoint = self.endpoint().await?;
        let notification = JsonRpcNotification::new(method, params);

        let timeout = self.timeout;
        let post = async move {
            let posted = tokio::time::timeout(timeout, endpoint.post(&notification)).await;
            Ok::<_, ToolbridgeError>(posted.ok().map(|response| response.map(|_| ())))
        };
        match on_io(self.io.as_ref(), &self.server, post).await? {
            Some(result) => result,
            None => Err(self.timed_out(method)),
        }
    }

    fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

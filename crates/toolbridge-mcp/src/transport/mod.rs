//! Transport layer for MCP communication
//!
//! Two framings share one contract:
//! - Stdio: a child process speaking one JSON message per line
//! - Http: one POST per message, answered with JSON or an event stream
//!
//! Transports built by [`DefaultTransportFactory`] register their pipes
//! and sockets with an [`IoRuntime`] of their own and run every exchange
//! there, so a request completes even while the caller's runtime is
//! blocked.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};
use toolbridge_config::{ServerConfig, TransportKind};
use toolbridge_core::{Result, ToolbridgeError};
use tracing::debug;

pub mod http;
pub mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

/// Transport trait for MCP communication.
///
/// Requests on one transport are expected to be issued one at a time; the
/// owning connection serializes them.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Bring the channel up (spawn the process, build the HTTP client).
    async fn connect(&self) -> Result<()>;

    /// Tear the channel down. Safe to call more than once.
    async fn disconnect(&self) -> Result<()>;

    /// Send a request and wait for its result, bounded by the request
    /// timeout. Soft failures leave the transport usable.
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value>;

    /// Fire-and-forget message.
    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()>;

    fn is_healthy(&self) -> bool;

    /// Session token assigned by the server, if any.
    fn session_id(&self) -> Option<String> {
        None
    }
}

/// Builds the transport for a server definition.
pub trait TransportFactory: Send + Sync {
    fn create(&self, server: &str, config: &ServerConfig) -> Result<Box<dyn Transport>>;
}

pub const DEFAULT_IO_THREADS: usize = 2;

/// Multi-thread runtime that owns transport I/O: child processes, pipes,
/// HTTP connections and request deadlines. Started on first use.
pub struct IoRuntime {
    threads: usize,
    runtime: OnceCell<Runtime>,
}

impl IoRuntime {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            runtime: OnceCell::new(),
        }
    }

    pub fn handle(&self) -> Result<Handle> {
        let runtime = self.runtime.get_or_try_init(|| {
            debug!("Starting transport I/O runtime with {} threads", self.threads);
            Builder::new_multi_thread()
                .worker_threads(self.threads)
                .thread_name("toolbridge-io")
                .enable_all()
                .build()
        })?;
        Ok(runtime.handle().clone())
    }
}

impl Default for IoRuntime {
    fn default() -> Self {
        Self::new(DEFAULT_IO_THREADS)
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        // A plain drop panics when it happens inside another runtime.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Run `future` on `io` when given, inline otherwise.
pub(crate) async fn on_io<F, T>(io: Option<&Handle>, server: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match io {
        Some(handle) => handle
            .spawn(future)
            .await
            .map_err(|e| ToolbridgeError::Disconnected {
                server: server.to_string(),
                reason: format!("I/O task failed: {e}"),
            })?,
        None => future.await,
    }
}

/// Builds stdio and HTTP transports bound to one shared [`IoRuntime`].
#[derive(Default)]
pub struct DefaultTransportFactory {
    io: IoRuntime,
}

impl DefaultTransportFactory {
    pub fn new(io: IoRuntime) -> Self {
        Self { io }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, server: &str, config: &ServerConfig) -> Result<Box<dyn Transport>> {
        config.validate(server)?;
        let io = self.io.handle()?;
        match config.kind {
            TransportKind::Subprocess => Ok(Box::new(
                StdioTransport::from_config(server, config)?.with_io(io),
            )),
            TransportKind::Http => Ok(Box::new(
                HttpTransport::from_config(server, config)?.with_io(io),
            )),
        }
    }
}

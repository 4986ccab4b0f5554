//! Stdio transport implementation for process-based MCP servers

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use toolbridge_config::{env_substitution, ServerConfig, TransportKind};
use toolbridge_core::{Result, ToolbridgeError};

use super::{on_io, Transport};
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

const TERMINATE_GRACE: Duration = Duration::from_secs(3);

struct Pipes {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

fn disconnected(server: &str, reason: impl Into<String>) -> ToolbridgeError {
    ToolbridgeError::Disconnected {
        server: server.to_string(),
        reason: reason.into(),
    }
}

impl Pipes {
    async fn write_line(&mut self, server: &str, line: &str) -> Result<()> {
        debug!("Sending to MCP server '{}': {}", server, line);
        let written = async {
            self.stdin.write_all(line.as_bytes()).await?;
            self.stdin.write_all(b"\n").await?;
            self.stdin.flush().await
        }
        .await;

        written.map_err(|e| disconnected(server, format!("failed to write to stdin: {e}")))
    }

    /// Read lines until the response to `id` shows up. Anything else is
    /// log noise or a late reply to an abandoned request.
    async fn read_response(&mut self, server: &str, id: &RequestId) -> Result<Value> {
        loop {
            let line = match self.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(disconnected(server, "server closed its stdout")),
                Err(e) => return Err(disconnected(server, format!("failed to read stdout: {e}"))),
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let message: Value = match serde_json::from_str(trimmed) {
                Ok(value) => value,
                Err(_) => {
                    debug!("Non-JSON output from MCP server '{}': {}", server, trimmed);
                    continue;
                }
            };

            if !JsonRpcResponse::answers(&message, id) {
                debug!("Skipping unrelated message from MCP server '{}': {}", server, trimmed);
                continue;
            }

            debug!("Received from MCP server '{}': {}", server, trimmed);
            return JsonRpcResponse::from_value(server, message)?.into_result(server);
        }
    }
}

async fn terminate(server: String, mut child: Child) -> Result<()> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain signal delivery to our own child.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => info!("MCP server '{}' exited with {}", server, status),
        Ok(Err(e)) => warn!("Failed waiting for MCP server '{}': {}", server, e),
        Err(_) => {
            warn!("MCP server '{}' ignored SIGTERM, killing it", server);
            if let Err(e) = child.kill().await {
                error!("Failed to kill MCP server '{}': {}", server, e);
            }
        }
    }
    Ok(())
}

/// Stdio transport for process-based MCP servers
pub struct StdioTransport {
    server: String,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,

    /// Kept outside the pipe lock so health checks never wait on I/O.
    child: Mutex<Option<Child>>,
    pipes: Arc<tokio::sync::Mutex<Option<Pipes>>>,
    next_id: AtomicU64,
    alive: AtomicBool,
    io: Option<Handle>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("server", &self.server)
            .field("command", &self.command)
            .field("args", &self.args)
            .finish()
    }
}

impl StdioTransport {
    pub fn new(
        server: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            server: server.into(),
            command: command.into(),
            args,
            env,
            timeout,
            child: Mutex::new(None),
            pipes: Arc::new(tokio::sync::Mutex::new(None)),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(false),
            io: None,
        }
    }

    /// Run the child and its pipes on `handle` instead of the caller's
    /// runtime.
    pub fn with_io(mut self, handle: Handle) -> Self {
        self.io = Some(handle);
        self
    }

    /// OS process id of the running child.
    pub fn pid(&self) -> Option<u32> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Child::id)
    }

    pub fn from_config(server: &str, config: &ServerConfig) -> Result<Self> {
        let command = config.command.clone().ok_or_else(|| {
            ToolbridgeError::Config(format!("Server '{server}' is missing 'command'"))
        })?;
        Ok(Self::new(
            server,
            command,
            config.args.clone(),
            config.env.clone(),
            config.request_timeout(),
        ))
    }

    fn build_command(&self, env: &BTreeMap<String, String>) -> Command {
        let mut cmd = if cfg!(windows) && matches!(self.command.as_str(), "npx" | "uvx") {
            // Those launchers are batch scripts on Windows.
            let mut cmd = Command::new("cmd");
            cmd.arg("/c").arg(&self.command);
            cmd
        } else {
            Command::new(&self.command)
        };

        cmd.args(&self.args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn connect_error(&self, reason: impl Into<String>) -> ToolbridgeError {
        ToolbridgeError::ConnectFailed {
            server: self.server.clone(),
            reason: reason.into(),
        }
    }

    fn disconnected(&self, reason: impl Into<String>) -> ToolbridgeError {
        disconnected(&self.server, reason)
    }

    /// A failed pipe means the child is unusable; protocol errors do not.
    fn note_failure<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ToolbridgeError::Disconnected { reason, .. }) = &result {
            self.mark_dead(reason);
        }
        result
    }

    fn mark_dead(&self, reason: &str) {
        if self.alive.swap(false, Ordering::SeqCst) {
            warn!("MCP server '{}' is no longer usable: {}", self.server, reason);
        }
    }

    /// Non-blocking check that the child has not exited.
    fn process_running(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    debug!("MCP server '{}' exited with {}", self.server, status);
                    false
                }
                Err(e) => {
                    debug!("Failed to poll MCP server '{}': {}", self.server, e);
                    false
                }
            },
            None => false,
        }
    }

    /// Fail fast, without touching the pipe, once the process is gone.
    fn ensure_running(&self) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(self.disconnected("transport is not connected"));
        }
        if !self.process_running() {
            self.mark_dead("process exited");
            return Err(self.disconnected("process exited"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Subprocess
    }

    async fn connect(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            return Ok(());
        }

        let env = env_substitution::substitute_map(&self.env)
            .map_err(|e| self.connect_error(e.to_string()))?;

        info!("Starting MCP server '{}' via stdio: {} {:?}", self.server, self.command, self.args);
        // Pipes and the exit watcher bind to the runtime entered at spawn.
        let spawned = {
            let _entered = self.io.as_ref().map(Handle::enter);
            self.build_command(&env).spawn()
        };
        let mut child = spawned
            .map_err(|e| self.connect_error(format!("failed to spawn '{}': {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.connect_error("failed to get process stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.connect_error("failed to get process stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let server = self.server.clone();
            let drain = async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let trimmed = line.trim();
                            if !trimmed.is_empty() {
                                debug!("MCP server '{}' stderr: {}", server, trimmed);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!("Stopped reading stderr of MCP server '{}': {}", server, e);
                            break;
                        }
                    }
                }
            };
            match &self.io {
                Some(handle) => drop(handle.spawn(drain)),
                None => drop(tokio::spawn(drain)),
            }
        }

        *self.pipes.lock().await = Some(Pipes {
            stdin,
            stdout: BufReader::new(stdout).lines(),
        });
        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);

        // Closing stdin is the signal well-behaved servers exit on.
        let pipes = Arc::clone(&self.pipes);
        let server = self.server.clone();
        on_io(self.io.as_ref(), &self.server, async move {
            if let Some(mut pipes) = pipes.lock().await.take() {
                let _ = pipes.stdin.shutdown().await;
            }
            Ok(())
        })
        .await?;

        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(child) = child else {
            return Ok(());
        };
        on_io(self.io.as_ref(), &self.server, terminate(server, child)).await
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.ensure_running()?;

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let request = JsonRpcRequest::new(id.clone(), method, params);
        let line = serde_json::to_string(&request)?;

        let pipes = Arc::clone(&self.pipes);
        let server = self.server.clone();
        let method = method.to_string();
        let timeout = self.timeout;
        let exchange = async move {
            let mut guard = pipes.lock().await;
            let pipes = guard
                .as_mut()
                .ok_or_else(|| disconnected(&server, "transport is not connected"))?;
            pipes.write_line(&server, &line).await?;

            let answered = tokio::time::timeout(timeout, pipes.read_response(&server, &id)).await;
            match answered {
                Ok(result) => result,
                Err(_) => {
                    warn!("Request {} '{}' to MCP server '{}' timed out", id, method, server);
                    Err(ToolbridgeError::Timeout {
                        server,
                        method,
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
        };

        let result = on_io(self.io.as_ref(), &self.server, exchange).await;
        self.note_failure(result)
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.ensure_running()?;

        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        let pipes = Arc::clone(&self.pipes);
        let server = self.server.clone();
        let write = async move {
            let mut guard = pipes.lock().await;
            let pipes = guard
                .as_mut()
                .ok_or_else(|| disconnected(&server, "transport is not connected"))?;
            pipes.write_line(&server, &line).await
        };

        let result = on_io(self.io.as_ref(), &self.server, write).await;
        self.note_failure(result)
    }

    fn is_healthy(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.process_running()
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result of invoking a tool, native or remote.
///
/// Transport-level failures are kept apart from failures the tool itself
/// reported, so an agent never mistakes a dropped connection for a tool
/// answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    /// The tool ran and produced output.
    Success {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw: Option<Value>,
    },

    /// The tool ran and reported a failure of its own.
    ToolError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw: Option<Value>,
    },

    /// The call was refused locally because the tool is disabled.
    Disabled { message: String },

    /// The channel to the tool failed: timeout, disconnect, bad response.
    TransportFailure { message: String },
}

impl ToolOutcome {
    pub fn success(text: impl Into<String>) -> Self {
        Self::Success {
            text: text.into(),
            raw: None,
        }
    }

    pub fn transport_failure(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// True for failures the agent is expected to reason about.
    pub fn is_application_failure(&self) -> bool {
        matches!(self, Self::ToolError { .. } | Self::Disabled { .. })
    }

    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::TransportFailure { .. })
    }

    /// Output text on success, failure message otherwise.
    pub fn text(&self) -> &str {
        match self {
            Self::Success { text, .. } => text,
            Self::ToolError { message, .. }
            | Self::Disabled { message }
            | Self::TransportFailure { message } => message,
        }
    }

    pub fn raw(&self) -> Option<&Value> {
        match self {
            Self::Success { raw, .. } | Self::ToolError { raw, .. } => raw.as_ref(),
            _ => None,
        }
    }

    /// Plain-text rendering handed back to the agent loop.
    pub fn to_agent_text(&self) -> String {
        match self {
            Self::Success { text, .. } => text.clone(),
            other => format!("Error: {}", other.text()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ToolbridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to connect to server '{server}': {reason}")]
    ConnectFailed { server: String, reason: String },

    #[error("Handshake with server '{server}' failed: {reason}")]
    HandshakeFailed { server: String, reason: String },

    #[error("Request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("Server '{server}' is not connected: {reason}")]
    Disconnected { server: String, reason: String },

    #[error("Server '{server}' returned HTTP {status}: {body}")]
    Http {
        server: String,
        status: u16,
        body: String,
    },

    #[error("Malformed response from server '{server}': {reason}")]
    MalformedResponse { server: String, reason: String },

    #[error("Server '{server}' returned RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("Invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("Server '{0}' is not configured")]
    ServerNotFound(String),

    #[error("Server '{0}' has no discovered tools")]
    NoToolSnapshot(String),

    #[error("Tool '{tool}' not found on server '{server}'")]
    ToolNotFound { server: String, tool: String },

    #[error("Blocking call failed: {0}")]
    BlockingCall(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ToolbridgeError {
    /// Soft failures leave the channel usable for the next request.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Http { .. }
                | Self::MalformedResponse { .. }
                | Self::Rpc { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ToolbridgeError>;

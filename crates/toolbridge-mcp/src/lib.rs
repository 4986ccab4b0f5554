//! MCP (Model Context Protocol) client for toolbridge
//!
//! Connects to tool servers over stdio or HTTP, keeps their tool catalogs,
//! and adapts remote tools to the local `Tool` trait so they can sit in
//! one registry next to native tools.

pub mod adapter;
pub mod connection;
pub mod context;
pub mod manager;
pub mod schema;
pub mod transport;
pub mod types;

pub use adapter::{adapted_name, normalize_result, McpToolAdapter};
pub use connection::{Connection, ConnectionState, McpTool};
pub use context::{McpToolSource, ToolContext};
pub use manager::{ClientManager, InitializeReport, ServerFailure, ServerStatus, ServerTestReport};
pub use schema::{FieldKind, InputShape};
pub use transport::{
    DefaultTransportFactory, HttpTransport, IoRuntime, StdioTransport, Transport, TransportFactory,
};

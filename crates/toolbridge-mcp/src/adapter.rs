//! Remote tools exposed through the local `Tool` trait.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use toolbridge_core::{Result, ToolOutcome};
use toolbridge_tools::Tool;

use crate::connection::McpTool;
use crate::manager::ClientManager;
use crate::schema::InputShape;
use crate::types::{ContentItem, ToolCallResult};

/// `<server>_<tool>` with anything outside `[A-Za-z0-9_]` replaced.
pub fn adapted_name(server: &str, tool: &str) -> String {
    format!("{server}_{tool}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Tool description followed by one line per parameter.
pub fn describe(tool: &McpTool, shape: &InputShape) -> String {
    let mut description = if tool.description.trim().is_empty() {
        format!("MCP tool: {}", tool.name)
    } else {
        tool.description.clone()
    };

    let fields = shape.fields();
    if fields.is_empty() {
        return description;
    }

    description.push_str("\n\nParameters:");
    for field in fields {
        description.push_str(&format!(
            "\n- {} ({}, {})",
            field.name,
            field.kind,
            if field.required { "required" } else { "optional" }
        ));
        if !field.description.is_empty() {
            description.push_str(&format!(": {}", field.description));
        }
        if let Some(default) = &field.default {
            description.push_str(&format!(" (default: {})", display_value(default)));
        }
        if !field.enum_values.is_empty() {
            let values: Vec<String> = field.enum_values.iter().map(display_value).collect();
            description.push_str(&format!(" (values: {})", values.join(", ")));
        }
    }
    description
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Turn a `tools/call` result into an outcome. The raw result rides along
/// either way.
pub fn normalize_result(result: Value) -> ToolOutcome {
    let parsed: Option<ToolCallResult> = serde_json::from_value(result.clone()).ok();
    let is_error = parsed.as_ref().map_or_else(
        || result.get("isError").and_then(Value::as_bool).unwrap_or(false),
        |r| r.is_error,
    );

    let mut parts = Vec::new();
    for item in parsed.map(|r| r.content).unwrap_or_default() {
        match item {
            ContentItem::Text { text } => parts.push(text),
            ContentItem::Resource { resource } => {
                if let Some(text) = resource.text.filter(|t| !t.is_empty()) {
                    parts.push(text);
                } else if let Some(blob) = resource.blob.filter(|b| !b.is_empty()) {
                    parts.push(format!("[Binary data: {} bytes]", blob.len()));
                }
            }
            ContentItem::Image { .. } | ContentItem::Other => {}
        }
    }

    let mut text = parts.join("\n");
    if text.is_empty() && !is_empty_result(&result) {
        text = result.to_string();
    }

    if is_error {
        ToolOutcome::ToolError {
            message: if text.is_empty() {
                "Tool execution failed".to_string()
            } else {
                text
            },
            raw: Some(result),
        }
    } else {
        ToolOutcome::Success {
            text: if text.is_empty() { "Success".to_string() } else { text },
            raw: Some(result),
        }
    }
}

fn is_empty_result(result: &Value) -> bool {
    match result {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// A discovered remote tool, callable through the registry.
///
/// Enablement is read from live configuration on every call, and the
/// owning server's connection is looked up per call so a reconnect is
/// picked up without re-adapting.
pub struct McpToolAdapter {
    name: String,
    description: String,
    server: String,
    tool: String,
    shape: InputShape,
    manager: Arc<ClientManager>,
}

impl McpToolAdapter {
    pub fn new(tool: &McpTool, manager: Arc<ClientManager>) -> Self {
        let shape = InputShape::from_schema(&tool.input_schema);
        Self {
            name: adapted_name(&tool.server_name, &tool.name),
            description: describe(tool, &shape),
            server: tool.server_name.clone(),
            tool: tool.name.clone(),
            shape,
            manager,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server
    }

    /// Name of the tool on its server.
    pub fn remote_name(&self) -> &str {
        &self.tool
    }

    pub fn shape(&self) -> &InputShape {
        &self.shape
    }
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        self.shape.to_json_schema()
    }

    async fn execute(&self, args: Value) -> Result<ToolOutcome> {
        if !self.manager.is_tool_enabled(&self.server, &self.tool) {
            debug!("Refusing call to disabled tool '{}'", self.name);
            return Ok(ToolOutcome::Disabled {
                message: format!(
                    "Tool '{}' on MCP server '{}' is disabled",
                    self.tool, self.server
                ),
            });
        }

        let arguments = self.shape.validate(&self.name, args)?;

        let Some(connection) = self.manager.connection(&self.server) else {
            return Ok(ToolOutcome::transport_failure(format!(
                "MCP server '{}' is not connected",
                self.server
            )));
        };
        if !connection.is_healthy() {
            return Ok(ToolOutcome::transport_failure(format!(
                "MCP server '{}' is not healthy",
                self.server
            )));
        }

        match connection.call_tool(&self.tool, arguments).await {
            Ok(result) => {
                let outcome = normalize_result(result);
                debug!(
                    "MCP tool '{}' finished: success={}, output_length={}",
                    self.name,
                    outcome.is_success(),
                    outcome.text().len()
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!("MCP tool '{}' failed: {}", self.name, e);
                Ok(ToolOutcome::transport_failure(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(description: &str, schema: Value) -> McpTool {
        McpTool {
            name: "add".into(),
            description: description.into(),
            input_schema: schema,
            server_name: "calc".into(),
            enabled: true,
        }
    }

    #[test]
    fn test_adapted_name() {
        assert_eq!(adapted_name("calc", "add"), "calc_add");
        assert_eq!(adapted_name("my-server", "read.file"), "my_server_read_file");
        assert_eq!(adapted_name("web search", "q"), "web_search_q");
    }

    #[test]
    fn test_describe_lists_parameters() {
        let tool = tool(
            "Add two numbers",
            json!({
                "properties": {
                    "a": {"type": "integer", "description": "First"},
                    "mode": {"type": "string", "enum": ["fast", "exact"], "default": "fast"}
                },
                "required": ["a"]
            }),
        );
        let shape = InputShape::from_schema(&tool.input_schema);
        let text = describe(&tool, &shape);

        assert!(text.starts_with("Add two numbers\n\nParameters:"));
        assert!(text.contains("- a (integer, required): First"));
        assert!(text.contains("- mode (string, optional) (default: fast) (values: fast, exact)"));
    }

    #[test]
    fn test_describe_fallback() {
        let tool = tool("", json!({}));
        let shape = InputShape::from_schema(&tool.input_schema);
        assert_eq!(describe(&tool, &shape), "MCP tool: add");
    }

    #[test]
    fn test_normalize_text_and_resources() {
        let outcome = normalize_result(json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "resource", "resource": {"uri": "file:///a", "text": "second"}},
                {"type": "resource", "resource": {"uri": "file:///b", "blob": "QUJDRA=="}},
                {"type": "image", "data": "...", "mimeType": "image/png"}
            ]
        }));

        assert!(outcome.is_success());
        assert_eq!(outcome.text(), "first\nsecond\n[Binary data: 8 bytes]");
        assert!(outcome.raw().is_some());
    }

    #[test]
    fn test_normalize_error_flag() {
        let outcome = normalize_result(json!({
            "content": [{"type": "text", "text": "division by zero"}],
            "isError": true
        }));
        assert!(outcome.is_application_failure());
        assert_eq!(outcome.text(), "division by zero");
        assert_eq!(outcome.raw().unwrap()["isError"], true);
    }

    #[test]
    fn test_normalize_without_text() {
        let empty = normalize_result(json!({"content": []}));
        assert_eq!(empty.text(), r#"{"content":[]}"#);

        let bare = normalize_result(json!({}));
        assert_eq!(bare.text(), "Success");

        let structured = normalize_result(json!({"value": 5}));
        assert_eq!(structured.text(), r#"{"value":5}"#);
    }
}

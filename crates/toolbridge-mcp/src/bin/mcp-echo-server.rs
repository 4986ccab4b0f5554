//! Minimal MCP server over stdio, used for smoke tests.
//!
//! Tools: `add`, `echo`, `fail` (reports isError), `slow` (replies after
//! `ms` milliseconds), `stall` (never replies) and `exit` (terminates the
//! process without replying).

use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

fn tool_list() -> Value {
    json!([
        {
            "name": "add",
            "description": "Add two integers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "a": {"type": "integer", "description": "First addend"},
                    "b": {"type": "integer", "description": "Second addend"}
                },
                "required": ["a", "b"]
            }
        },
        {
            "name": "echo",
            "description": "Return the message unchanged",
            "inputSchema": {
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            }
        },
        {"name": "fail", "description": "Always reports an error", "inputSchema": {"type": "object"}},
        {
            "name": "slow",
            "description": "Reply after a delay",
            "inputSchema": {
                "type": "object",
                "properties": {"ms": {"type": "integer"}},
                "required": ["ms"]
            }
        },
        {"name": "stall", "description": "Never replies", "inputSchema": {"type": "object"}},
        {"name": "exit", "description": "Exit the server", "inputSchema": {"type": "object"}}
    ])
}

fn text_result(text: impl Into<String>, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": text.into()}],
        "isError": is_error
    })
}

/// `None` means no reply should be written.
fn call_tool(params: &Value) -> Option<Result<Value, (i64, String)>> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let result = match name {
        "add" => {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(text_result((a + b).to_string(), false))
        }
        "echo" => {
            let message = args.get("message").and_then(Value::as_str).unwrap_or_default();
            Ok(text_result(message, false))
        }
        "fail" => Ok(text_result("intentional failure", true)),
        "slow" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            thread::sleep(Duration::from_millis(ms));
            Ok(text_result(format!("slept {ms}ms"), false))
        }
        "stall" => return None,
        "exit" => std::process::exit(0),
        other => Err((-32602, format!("unknown tool: {other}"))),
    };
    Some(result)
}

fn handle(message: &Value) -> Option<Value> {
    // Notifications carry no id and get no reply.
    let id = message.get("id")?.clone();
    let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    let outcome = match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mcp-echo-server", "version": env!("CARGO_PKG_VERSION")}
        })),
        "tools/list" => Ok(json!({"tools": tool_list()})),
        "tools/call" => call_tool(&params)?,
        "ping" => Ok(json!({})),
        other => Err((-32601, format!("method not found: {other}"))),
    };

    Some(match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => {
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        }
    })
}

fn main() -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    eprintln!("mcp-echo-server starting");
    // Log noise on stdout; clients must skip it.
    writeln!(stdout, "mcp-echo-server ready")?;
    stdout.flush()?;

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                eprintln!("ignoring unparsable line: {e}");
                continue;
            }
        };
        if let Some(reply) = handle(&message) {
            writeln!(stdout, "{reply}")?;
            stdout.flush()?;
        }
    }
    Ok(())
}

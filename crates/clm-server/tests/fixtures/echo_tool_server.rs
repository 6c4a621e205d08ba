//! Mock downstream tool server for integration testing.
//!
//! Reads newline-delimited JSON from stdin and writes newline-delimited JSON
//! responses to stdout. Implements enough of the downstream wire protocol to
//! exercise the client's framing, catalog parsing, call routing, timeouts,
//! and crash handling.
//!
//! # Supported methods
//!
//! - `initialize` — returns server capabilities
//! - `tools/list` — returns `Write` and `Read` tool schemas
//! - `tools/call` — performs real file I/O for `Write`/`Read`
//! - `notifications/initialized` — accepted, no response
//!
//! # Special behaviors
//!
//! - When `tools/call` arguments contain `"slow": true`, the server sleeps
//!   for 5 seconds before responding (for timeout testing).
//! - When `tools/call` targets `crash`, the server exits with code 42.

use serde_json::{Value, json};
use std::io::{BufRead, BufReader, Write};

fn main() {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        handle_message(&msg, &mut writer);
    }
}

fn handle_message(msg: &Value, writer: &mut impl Write) {
    let method = msg.get("method").and_then(|v| v.as_str());
    let id = msg.get("id").cloned();

    match method {
        Some("initialize") => {
            let resp = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2025-03-26",
                    "capabilities": {
                        "tools": {}
                    },
                    "serverInfo": {
                        "name": "echo-tool-server",
                        "version": "0.1.0"
                    }
                }
            });
            write_msg(writer, &resp);
        }

        Some("tools/list") => {
            let resp = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "tools": [
                        {
                            "name": "Write",
                            "description": "Write content to a file",
                            "inputSchema": {
                                "type": "object",
                                "properties": {
                                    "file_path": {"type": "string"},
                                    "content": {"type": "string"}
                                },
                                "required": ["file_path", "content"]
                            }
                        },
                        {
                            "name": "Read",
                            "description": "Read a file",
                            "inputSchema": {
                                "type": "object",
                                "properties": {
                                    "file_path": {"type": "string"}
                                },
                                "required": ["file_path"]
                            }
                        }
                    ]
                }
            });
            write_msg(writer, &resp);
        }

        Some("tools/call") => {
            let tool_name = msg
                .pointer("/params/name")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let arguments = msg
                .pointer("/params/arguments")
                .cloned()
                .unwrap_or(json!({}));

            // Special: crash on demand
            if tool_name == "crash" {
                std::process::exit(42);
            }

            // Special: slow mode for timeout testing
            if arguments.get("slow").and_then(|v| v.as_bool()) == Some(true) {
                std::thread::sleep(std::time::Duration::from_secs(5));
            }

            let resp = match run_tool(tool_name, &arguments) {
                Ok(text) => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [{"type": "text", "text": text}]
                    }
                }),
                Err(text) => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [{"type": "text", "text": text}],
                        "isError": true
                    }
                }),
            };
            write_msg(writer, &resp);
        }

        Some("notifications/initialized") => {
            // Notifications have no response
        }

        Some(unknown) => {
            if let Some(req_id) = id {
                let resp = json!({
                    "jsonrpc": "2.0",
                    "id": req_id,
                    "error": {
                        "code": -32601,
                        "message": format!("Method not found: {unknown}")
                    }
                });
                write_msg(writer, &resp);
            }
        }

        None => {
            // Response from the client side; nothing to do
        }
    }
}

fn run_tool(tool: &str, arguments: &Value) -> Result<String, String> {
    match tool {
        "Write" => {
            let path = arguments
                .get("file_path")
                .and_then(|v| v.as_str())
                .ok_or("missing file_path")?;
            let content = arguments
                .get("content")
                .and_then(|v| v.as_str())
                .ok_or("missing content")?;
            std::fs::write(path, content).map_err(|e| e.to_string())?;
            Ok(format!("wrote {} bytes to {path}", content.len()))
        }
        "Read" => {
            let path = arguments
                .get("file_path")
                .and_then(|v| v.as_str())
                .ok_or("missing file_path")?;
            std::fs::read_to_string(path).map_err(|e| e.to_string())
        }
        other => Err(format!("unknown tool: {other}")),
    }
}

fn write_msg(writer: &mut impl Write, msg: &Value) {
    let s = serde_json::to_string(msg).expect("serialize JSON");
    writeln!(writer, "{s}").expect("write to stdout");
    writer.flush().expect("flush stdout");
}

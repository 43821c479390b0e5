//! Stand-in worker for integration testing
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout, one request at a time.
//!
//! Methods:
//! - `tools/list`: fixed tool schema
//! - `browser.newContext`: returns a fresh `{ "guid": ... }`
//! - `context.dispose`: forgets the handle
//! - `mock.contexts`: live context handles, in creation order
//! - `mock.notify`: emits a `notifications/message` before replying
//! - `mock.sleep`: replies after `params.ms` milliseconds
//! - `mock.fail`: replies with an error
//! - `mock.crash`: exits with status 1 without replying
//! - anything else: echoes the method and params
//!
//! Environment variables:
//! - MOCK_ANNOUNCE_TOOLS: announce tools via `notifications/initialized` on startup
//! - MOCK_SILENT_DISCOVERY: never answer `tools/list`

use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn tool_schema() -> Value {
    json!([
        { "name": "browser_navigate", "description": "Navigate to a URL", "inputSchema": { "type": "object" } },
        { "name": "browser_click", "description": "Click an element", "inputSchema": { "type": "object" } },
    ])
}

async fn emit(stdout: &mut tokio::io::Stdout, message: Value) -> std::io::Result<()> {
    let mut line = message.to_string();
    line.push('\n');
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let announce = std::env::var_os("MOCK_ANNOUNCE_TOOLS").is_some();
    let silent_discovery = std::env::var_os("MOCK_SILENT_DISCOVERY").is_some();

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut contexts: Vec<String> = Vec::new();
    let mut next_context = 0u64;

    eprintln!("mock-worker: started (pid {})", std::process::id());

    if announce {
        emit(
            &mut stdout,
            json!({ "jsonrpc": "2.0", "method": "notifications/initialized", "params": { "tools": tool_schema() } }),
        )
        .await?;
    }

    while let Some(line) = lines.next_line().await? {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock-worker: unparseable input: {}", line);
            continue;
        };

        let id = request.get("id").cloned().unwrap_or(Value::Null);
        // Replies to our own requests carry no method
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            continue;
        };
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let result = match method {
            "tools/list" if silent_discovery => continue,
            "tools/list" => json!({ "tools": tool_schema() }),
            "browser.newContext" => {
                next_context += 1;
                let guid = format!("context@{}", next_context);
                contexts.push(guid.clone());
                json!({ "guid": guid })
            }
            "context.dispose" => {
                let guid = params.get("guid").and_then(Value::as_str).unwrap_or_default();
                contexts.retain(|c| c.as_str() != guid);
                json!({})
            }
            "mock.contexts" => json!({ "contexts": contexts }),
            "mock.notify" => {
                emit(
                    &mut stdout,
                    json!({ "jsonrpc": "2.0", "method": "notifications/message", "params": { "level": "info", "data": params } }),
                )
                .await?;
                json!({ "notified": true })
            }
            "mock.sleep" => {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                json!({ "slept": ms })
            }
            "mock.fail" => {
                emit(
                    &mut stdout,
                    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": -1, "message": "requested failure" } }),
                )
                .await?;
                continue;
            }
            "mock.crash" => {
                eprintln!("mock-worker: crashing on request");
                std::process::exit(1);
            }
            other => json!({ "method": other, "params": params }),
        };

        emit(&mut stdout, json!({ "jsonrpc": "2.0", "id": id, "result": result })).await?;
    }

    Ok(())
}

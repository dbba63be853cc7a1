//! A minimal newline-delimited JSON-RPC server on stdin/stdout.
//!
//! Put it on a broker with the server adaptor:
//!
//! ```text
//! mcp-amqp-server-adaptor --server-name calculator --exchange-name mcp \
//!     --command target/debug/examples/stdio_calculator
//! ```

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn answer(request: &Value) -> Option<Value> {
    // ---
    let id = request.get("id")?.clone();
    let params = &request["params"];

    let outcome = match request["method"].as_str()? {
        "initialize" => json!({ "result": {
            "protocolVersion": "2025-03-26",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "stdio-calculator", "version": "0.1.0" },
        }}),
        "tools/list" => json!({ "result": { "tools": [{ "name": "add" }] } }),
        "tools/call" => {
            let a = params["arguments"]["a"].as_i64().unwrap_or(0);
            let b = params["arguments"]["b"].as_i64().unwrap_or(0);
            json!({ "result": { "content": [{ "type": "text", "text": (a + b).to_string() }] } })
        }
        other => json!({ "error": { "code": -32601, "message": format!("unknown method {other}") } }),
    };

    let mut reply = json!({ "jsonrpc": "2.0", "id": id });
    if let (Some(reply), Some(outcome)) = (reply.as_object_mut(), outcome.as_object()) {
        reply.extend(outcome.clone());
    }
    Some(reply)
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            eprintln!("stdio-calculator: ignoring malformed line");
            continue;
        };

        if let Some(reply) = answer(&request) {
            stdout.write_all(format!("{reply}\n").as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

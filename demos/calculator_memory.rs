//! Client and server talking through the in-memory hub.
//!
//! Run with `cargo run --example calculator_memory`.

use std::sync::Arc;

use mcp_amqp_bridge::{
    adaptor::ChannelHandler, BrokerConfig, ClientTransport, JsonRpcMessage, McpTransport, MemoryConnector,
    MemoryHub, Result, ServerTransport, TransportOptions,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let hub = MemoryHub::new();
    let broker = BrokerConfig::builder()
        .hostname("memory")
        .username("guest")
        .password("guest")
        .without_env()
        .build()?;
    let options = TransportOptions::new(broker, "calculator", "mcp")?;

    let (server_handler, mut requests) = ChannelHandler::new();
    let server = ServerTransport::new(
        options.clone(),
        Arc::new(MemoryConnector::new(Arc::clone(&hub))),
        server_handler,
    );
    server.start().await?;

    let responder = {
        let server = server.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let (Some(id), Ok(body)) = (request.id().cloned(), serde_json::to_value(&request)) else {
                    continue;
                };
                let a = body["params"]["a"].as_i64().unwrap_or(0);
                let b = body["params"]["b"].as_i64().unwrap_or(0);
                let _ = server.send(JsonRpcMessage::result(id, json!({ "sum": a + b }))).await;
            }
        })
    };

    let (client_handler, mut replies) = ChannelHandler::new();
    let client = ClientTransport::new(options, Arc::new(MemoryConnector::new(hub)), client_handler);
    client.start().await?;

    client
        .send(JsonRpcMessage::request(1, "add", json!({ "a": 20, "b": 3 })))
        .await?;

    if let Some(reply) = replies.recv().await {
        println!("{}", serde_json::to_string(&reply)?);
    }

    client.close().await?;
    server.close().await?;
    responder.await.ok();
    Ok(())
}

//! Interceptor that blocks one tool and redacts the arguments of the others.
//!
//! Clients publish to `mcp-in`, servers listen on `mcp-out`. Broker settings
//! come from the `AMQP_*` environment variables.

use std::sync::Arc;

use mcp_amqp_bridge::{
    create_amqp091_connector, BrokerConfig, Headers, InterceptPolicy, Interceptor, InterceptorDecision,
    InterceptorOptions, JsonRpcMessage, Result, CLIENT_ID_HEADER,
};
use serde_json::json;

struct Redactor;

#[async_trait::async_trait]
impl InterceptPolicy for Redactor {
    async fn on_client_to_server(&self, message: &JsonRpcMessage, headers: &Headers) -> Result<InterceptorDecision> {
        // ---
        let JsonRpcMessage::Request { id, method, params, .. } = message else {
            return Ok(InterceptorDecision::Forward);
        };

        if method != "tools/call" {
            return Ok(InterceptorDecision::Forward);
        }

        let tool = params.as_ref().and_then(|p| p["name"].as_str()).unwrap_or_default();
        if tool == "delete_everything" {
            let who = headers.get(CLIENT_ID_HEADER).map(String::as_str).unwrap_or("unknown client");
            return Ok(InterceptorDecision::reject_with_error(
                message,
                format!("{tool} is not available to {who}"),
            ));
        }

        Ok(InterceptorDecision::Transform(JsonRpcMessage::request(
            id.clone(),
            method.clone(),
            json!({ "name": tool, "arguments": { "redacted": true } }),
        )))
    }

    async fn on_server_to_client(&self, _message: &JsonRpcMessage, _headers: &Headers) -> Result<InterceptorDecision> {
        Ok(InterceptorDecision::Forward)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let options = InterceptorOptions::new(BrokerConfig::builder().build()?, "mcp-in", "mcp-out")?;
    let interceptor = Interceptor::new(options, create_amqp091_connector()?, Arc::new(Redactor));

    interceptor.start().await?;
    tokio::signal::ctrl_c().await?;
    interceptor.close().await?;
    Ok(())
}

// tests/interceptor.rs

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{broker, connector, eventually, Probe, SERVER};
use mcp_amqp_bridge::{
    // ---
    ClientTransport,
    Envelope,
    Headers,
    InterceptPolicy,
    Interceptor,
    InterceptorDecision,
    InterceptorOptions,
    JsonRpcMessage,
    McpTransport,
    MemoryHub,
    PassthroughPolicy,
    RequestId,
    Result,
    ServerTransport,
    Settlement,
    TransportError,
    TransportOptions,
    TransportState,
    CLIENT_ID_HEADER,
    REPLY_TO_HEADER,
};

const IN: &str = "mcp-in";
const OUT: &str = "mcp-out";

type Rule = Box<dyn Fn(&JsonRpcMessage, &Headers) -> Result<InterceptorDecision> + Send + Sync>;

/// Policy built from one closure per direction.
struct Rules {
    c2s: Rule,
    s2c: Rule,
}

impl Rules {
    fn client_side(rule: impl Fn(&JsonRpcMessage, &Headers) -> Result<InterceptorDecision> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            c2s: Box::new(rule),
            s2c: Box::new(|_, _| Ok(InterceptorDecision::Forward)),
        })
    }

    fn server_side(rule: impl Fn(&JsonRpcMessage, &Headers) -> Result<InterceptorDecision> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            c2s: Box::new(|_, _| Ok(InterceptorDecision::Forward)),
            s2c: Box::new(rule),
        })
    }
}

#[async_trait::async_trait]
impl InterceptPolicy for Rules {
    async fn on_client_to_server(&self, message: &JsonRpcMessage, headers: &Headers) -> Result<InterceptorDecision> {
        (self.c2s)(message, headers)
    }

    async fn on_server_to_client(&self, message: &JsonRpcMessage, headers: &Headers) -> Result<InterceptorDecision> {
        (self.s2c)(message, headers)
    }
}

struct Panics;

#[async_trait::async_trait]
impl InterceptPolicy for Panics {
    async fn on_client_to_server(&self, _m: &JsonRpcMessage, _h: &Headers) -> Result<InterceptorDecision> {
        panic!("policy bug");
    }

    async fn on_server_to_client(&self, _m: &JsonRpcMessage, _h: &Headers) -> Result<InterceptorDecision> {
        Ok(InterceptorDecision::Forward)
    }
}

struct Rig {
    hub: Arc<MemoryHub>,
    interceptor: Interceptor,
    server: ServerTransport,
    server_rx: common::ProbeRx,
    client: ClientTransport,
    client_rx: common::ProbeRx,
}

async fn rig(policy: Arc<dyn InterceptPolicy>) -> Rig {
    // ---
    let hub = MemoryHub::new();

    let options = InterceptorOptions::new(broker(), IN, OUT).unwrap();
    let interceptor = Interceptor::new(options, connector(&hub), policy);
    interceptor.start().await.expect("interceptor start");

    let (server_probe, server_rx) = Probe::new();
    let server = ServerTransport::new(
        TransportOptions::new(broker(), SERVER, OUT).unwrap(),
        connector(&hub),
        server_probe,
    );
    server.start().await.unwrap();

    let (client_probe, client_rx) = Probe::new();
    let client = ClientTransport::new(
        TransportOptions::new(broker(), SERVER, IN).unwrap(),
        connector(&hub),
        client_probe,
    );
    client.start().await.unwrap();

    Rig {
        hub,
        interceptor,
        server,
        server_rx,
        client,
        client_rx,
    }
}

/// Publications the interceptor made toward the server.
fn outbound(hub: &MemoryHub) -> usize {
    // ---
    hub.publications().iter().filter(|p| p.exchange == OUT).count()
}

/// Answer every request the server sees with `{"ok": true}`.
async fn answer(rig: &mut Rig) {
    // ---
    let request = rig.server_rx.next().await;
    let id = request.id().cloned().unwrap();
    rig.server
        .send(JsonRpcMessage::result(id, json!({"ok": true})))
        .await
        .unwrap();
}

#[tokio::test]
async fn passthrough_round_trip() {
    // ---
    let mut rig = rig(Arc::new(PassthroughPolicy)).await;

    rig.client
        .send(JsonRpcMessage::request(1, "tools/list", json!({})))
        .await
        .unwrap();
    answer(&mut rig).await;

    let reply = rig.client_rx.next().await;
    assert_eq!(reply.id(), Some(&RequestId::Number(1)));

    let forwarded: Vec<_> = rig
        .hub
        .publications()
        .into_iter()
        .filter(|p| p.exchange == OUT && p.routing_key == "mcp.calculator.request")
        .collect();
    assert_eq!(forwarded.len(), 1);
    assert!(forwarded[0].reply_to.is_some());
    assert!(forwarded[0].headers.contains_key(CLIENT_ID_HEADER));
}

#[tokio::test]
async fn policy_sees_wire_headers() {
    // ---
    let mut rig = rig(Rules::client_side(|message, headers| {
        if headers.contains_key(REPLY_TO_HEADER) && headers.contains_key(CLIENT_ID_HEADER) {
            Ok(InterceptorDecision::Forward)
        } else {
            Ok(InterceptorDecision::reject_with_error(message, "missing headers"))
        }
    }))
    .await;

    rig.client
        .send(JsonRpcMessage::request(1, "a", json!({})))
        .await
        .unwrap();
    answer(&mut rig).await;

    assert!(rig.client_rx.next().await.is_response());
}

#[tokio::test]
async fn reject_answers_the_client_directly() {
    // ---
    let mut rig = rig(Rules::client_side(|message, _| {
        Ok(InterceptorDecision::reject_with_error(message, "tool not allowed"))
    }))
    .await;

    rig.client
        .send(JsonRpcMessage::request(5, "tools/call", json!({"name": "rm"})))
        .await
        .unwrap();

    let reply = rig.client_rx.next().await;
    assert_eq!(reply.id(), Some(&RequestId::Number(5)));

    let body = serde_json::to_value(&reply).unwrap();
    assert_eq!(body["error"]["code"], json!(-32001));
    assert_eq!(body["error"]["message"], json!("tool not allowed"));

    rig.server_rx.nothing().await;

    // Exactly one answer, published on the inbound exchange to the
    // requester's own reply key, and nothing toward the server.
    let reply_key = rig.client.reply_routing_key().to_string();
    let answers: Vec<_> = rig
        .hub
        .publications()
        .into_iter()
        .filter(|p| p.routing_key == reply_key)
        .collect();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].exchange, IN);

    let sent = answers[0].json().unwrap();
    assert_eq!(sent["error"]["message"], json!("tool not allowed"));
    assert_eq!(sent["id"], json!(format!("{}-5", rig.client.client_id())));

    assert_eq!(outbound(&rig.hub), 0);
}

#[tokio::test]
async fn drop_consumes_silently() {
    // ---
    let mut rig = rig(Rules::client_side(|_, _| Ok(InterceptorDecision::Drop))).await;

    rig.client
        .send(JsonRpcMessage::notification("notifications/cancelled", None))
        .await
        .unwrap();

    rig.server_rx.nothing().await;
    rig.client_rx.nothing().await;

    eventually(|| !rig.hub.settlements().is_empty()).await;

    let settled: Vec<_> = rig
        .hub
        .settlements()
        .into_iter()
        .filter(|s| s.routing_key == "mcp.calculator.request")
        .collect();
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].outcome, Settlement::Ack);

    assert_eq!(outbound(&rig.hub), 0);
}

#[tokio::test]
async fn undecodable_traffic_is_rejected_not_forwarded() {
    // ---
    let mut rig = rig(Arc::new(PassthroughPolicy)).await;

    rig.hub
        .inject(IN, Envelope::new("mcp.calculator.request", &b"{truncated"[..]))
        .unwrap();

    eventually(|| !rig.hub.settlements().is_empty()).await;

    let settled = rig.hub.settlements();
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].outcome, Settlement::Reject);

    rig.server_rx.nothing().await;
    assert_eq!(outbound(&rig.hub), 0);

    // The pump keeps going after a bad record.
    rig.client
        .send(JsonRpcMessage::request(1, "tools/list", json!({})))
        .await
        .unwrap();
    answer(&mut rig).await;
    assert!(rig.client_rx.next().await.is_response());
}

#[tokio::test]
async fn transform_rewrites_requests() {
    // ---
    let mut rig = rig(Rules::client_side(|message, _| match message {
        JsonRpcMessage::Request { id, method, .. } => Ok(InterceptorDecision::Transform(
            JsonRpcMessage::request(id.clone(), method.clone(), json!({"redacted": true})),
        )),
        _ => Ok(InterceptorDecision::Forward),
    }))
    .await;

    rig.client
        .send(JsonRpcMessage::request(2, "tools/call", json!({"secret": "hunter2"})))
        .await
        .unwrap();

    let seen = rig.server_rx.next().await;
    let body = serde_json::to_value(&seen).unwrap();
    assert_eq!(body["params"], json!({"redacted": true}));

    // Routing survives the rewrite.
    let id = seen.id().cloned().unwrap();
    rig.server.send(JsonRpcMessage::result(id, json!(1))).await.unwrap();
    assert_eq!(rig.client_rx.next().await.id(), Some(&RequestId::Number(2)));
}

#[tokio::test]
async fn transform_rewrites_replies() {
    // ---
    let mut rig = rig(Rules::server_side(|message, _| {
        Ok(InterceptorDecision::Transform(JsonRpcMessage::result(
            message.id().cloned().unwrap(),
            json!({"filtered": true}),
        )))
    }))
    .await;

    rig.client
        .send(JsonRpcMessage::request(1, "a", json!({})))
        .await
        .unwrap();
    answer(&mut rig).await;

    let reply = rig.client_rx.next().await;
    assert_eq!(reply.id(), Some(&RequestId::Number(1)));
    assert_eq!(serde_json::to_value(&reply).unwrap()["result"], json!({"filtered": true}));
}

#[tokio::test]
async fn failing_policy_forwards() {
    // ---
    let mut rig = rig(Rules::client_side(|_, _| {
        Err(TransportError::message_msg("policy store unavailable"))
    }))
    .await;

    rig.client
        .send(JsonRpcMessage::request(1, "a", json!({})))
        .await
        .unwrap();
    answer(&mut rig).await;

    assert!(rig.client_rx.next().await.is_response());
}

#[tokio::test]
async fn panicking_policy_forwards() {
    // ---
    let mut rig = rig(Arc::new(Panics)).await;

    rig.client
        .send(JsonRpcMessage::request(1, "a", json!({})))
        .await
        .unwrap();
    answer(&mut rig).await;

    assert!(rig.client_rx.next().await.is_response());
    assert_eq!(rig.interceptor.state(), TransportState::Ready);
}

#[tokio::test]
async fn close_stops_forwarding() {
    // ---
    let mut rig = rig(Arc::new(PassthroughPolicy)).await;

    rig.interceptor.close().await.unwrap();
    rig.interceptor.close().await.unwrap();
    assert_eq!(rig.interceptor.state(), TransportState::Closed);

    rig.client
        .send(JsonRpcMessage::request(1, "a", json!({})))
        .await
        .unwrap();

    rig.server_rx.nothing().await;
}

#[tokio::test]
async fn same_exchange_twice_is_invalid() {
    // ---
    let err = InterceptorOptions::new(broker(), "mcp", "mcp").unwrap_err();
    assert_eq!(err.field(), Some("out_exchange"));
}

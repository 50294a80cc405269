use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::*;
use crate::bus::NetworkEventBus;
use crate::messenger::{InMemoryMessenger, Messenger};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EchoPayload {
    text: String,
}

/// Answers echo requests the way a proxy-side responder would: reply on the
/// response channel, targeted at the requesting server.
fn spawn_echo_responder(messenger: Arc<dyn Messenger>) {
    let bus = NetworkEventBus::new(messenger);
    let reply_bus = bus.clone();
    // Registrations only end on explicit close, so the handle can be dropped.
    let _ = bus.register(REQUEST_CHANNEL, move |request: RpcRequest, source: &str| {
        let reply_bus = reply_bus.clone();
        let source = source.to_string();
        let response = match request.method.as_str() {
            "echo" => RpcResponse::success(request.correlation_id, request.payload),
            other => RpcResponse::failure(request.correlation_id, format!("no such method: {other}")),
        };
        tokio::spawn(async move {
            reply_bus
                .send_to_server(RESPONSE_CHANNEL, &source, &response)
                .await;
        });
    });
}

/// Loopback setup: the local instance is its own proxy, so requests sent to
/// the proxy and responses sent back by name both deliver in-process.
fn loopback_client() -> RpcClient {
    let messenger: Arc<dyn Messenger> = Arc::new(InMemoryMessenger::new("velocity", "velocity"));
    spawn_echo_responder(messenger.clone());
    RpcClient::new(messenger)
}

#[tokio::test]
async fn call_roundtrips_payload() {
    let client = loopback_client();

    let reply: EchoPayload = client
        .call_proxy("svc", "echo", &EchoPayload { text: "hello".into() })
        .await
        .unwrap();

    assert_eq!(reply.text, "hello");
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn server_directed_call_reaches_a_named_server() {
    let messenger: Arc<dyn Messenger> = Arc::new(InMemoryMessenger::new("lobby", "velocity"));
    spawn_echo_responder(messenger.clone());
    let client = RpcClient::new(messenger);

    // Addressed to the local instance by name, answered by its responder.
    let reply: EchoPayload = client
        .call_server("lobby", "svc", "echo", &EchoPayload { text: "direct".into() })
        .await
        .unwrap();
    assert_eq!(reply.text, "direct");

    // Addressed to a different server: nothing in-process answers.
    let miss: Result<EchoPayload, RpcError> = client
        .call_server_with_timeout(
            "arena",
            "svc",
            "echo",
            &EchoPayload { text: String::new() },
            Duration::from_millis(50),
        )
        .await;
    assert!(matches!(miss, Err(RpcError::Timeout { .. })));
}

#[tokio::test]
async fn remote_failure_surfaces_as_remote_error() {
    let client = loopback_client();

    let result: Result<EchoPayload, RpcError> = client
        .call_proxy("svc", "nope", &EchoPayload { text: String::new() })
        .await;

    match result {
        Err(RpcError::Remote { message }) => assert!(message.contains("no such method")),
        other => panic!("expected remote error, got {other:?}"),
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn unanswered_call_times_out_and_clears_pending() {
    // A backend that is not the proxy: its requests go nowhere in-process.
    let messenger: Arc<dyn Messenger> = Arc::new(InMemoryMessenger::new("a", "velocity"));
    let client = RpcClient::new(messenger);

    let result: Result<EchoPayload, RpcError> = client
        .call_proxy_with_timeout(
            "svc",
            "echo",
            &EchoPayload { text: String::new() },
            Duration::from_millis(50),
        )
        .await;

    assert!(matches!(result, Err(RpcError::Timeout { .. })));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn close_fails_in_flight_calls_and_rejects_new_ones() {
    let messenger: Arc<dyn Messenger> = Arc::new(InMemoryMessenger::new("a", "velocity"));
    let client = Arc::new(RpcClient::new(messenger));

    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call_proxy_with_timeout::<_, EchoPayload>(
                    "svc",
                    "echo",
                    &json!({}),
                    Duration::from_secs(30),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.pending_requests(), 1);

    client.close();
    client.close();

    assert!(matches!(in_flight.await.unwrap(), Err(RpcError::Closed)));
    assert_eq!(client.pending_requests(), 0);

    let late: Result<EchoPayload, RpcError> = client.call_proxy("svc", "echo", &json!({})).await;
    assert!(matches!(late, Err(RpcError::Closed)));
}

#[tokio::test]
async fn unmatched_responses_are_discarded() {
    let messenger = Arc::new(InMemoryMessenger::new("velocity", "velocity"));
    let client = RpcClient::new(messenger.clone() as Arc<dyn Messenger>);

    let stray = NetworkEventBus::new(messenger as Arc<dyn Messenger>);
    stray
        .send_to_server(
            RESPONSE_CHANNEL,
            "velocity",
            &RpcResponse::success("no-such-correlation", json!(1)),
        )
        .await;

    assert_eq!(client.pending_requests(), 0);
}

#[test]
fn request_wire_format_uses_camel_case() {
    let request = RpcRequest {
        correlation_id: "cid".into(),
        service: "svc".into(),
        method: "echo".into(),
        payload: json!({"k": 1}),
        created_at: 123,
    };
    let json: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&request).unwrap()).unwrap();

    assert_eq!(json["correlationId"], "cid");
    assert_eq!(json["service"], "svc");
    assert_eq!(json["method"], "echo");
    assert_eq!(json["payload"]["k"], 1);
    assert_eq!(json["createdAt"], 123);
}

#[test]
fn response_decode_tolerates_missing_optionals() {
    let response: RpcResponse =
        serde_json::from_str(r#"{"correlationId":"cid","ok":true,"createdAt":1}"#).unwrap();
    assert!(response.ok);
    assert!(response.result.is_none());
    assert!(response.error.is_none());
}

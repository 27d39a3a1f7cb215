//! End-to-end tests against a real gateway on an ephemeral port.
//!
//! HTTP is driven with `reqwest`, the socket with `tokio-tungstenite`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use clawgate::auth::challenge::{sign_response, ChallengeConfig, ConnectClaims};
use clawgate::auth::Role;
use clawgate::server::startup::{run_server_with_config, ServerConfig, ServerHandle};
use clawgate::server::ws::{WsServerConfig, WsServerState, PROTOCOL_VERSION};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "integration-secret";

fn gateway_config() -> WsServerConfig {
    WsServerConfig {
        auth: ChallengeConfig {
            enabled: true,
            secret: Some(SECRET.to_string()),
            max_age: Duration::from_secs(10),
        },
        ..WsServerConfig::default()
    }
}

async fn start_gateway(config: WsServerConfig) -> ServerHandle {
    let ws_state = Arc::new(WsServerState::new(config));
    run_server_with_config(ServerConfig::for_testing(ws_state))
        .await
        .unwrap()
}

async fn next_message(socket: &mut Socket) -> Message {
    tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("socket ended")
        .expect("socket error")
}

async fn next_json(socket: &mut Socket) -> Value {
    match next_message(socket).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Read frames until the response for `id`, skipping events.
async fn response_for(socket: &mut Socket, id: &str) -> Value {
    loop {
        let frame = next_json(socket).await;
        if frame["type"] == "res" && frame["id"] == id {
            return frame;
        }
    }
}

/// Read frames until a close frame arrives; returns `(code, reason)`.
async fn expect_close(socket: &mut Socket) -> (u16, String) {
    loop {
        if let Message::Close(frame) = next_message(socket).await {
            let frame = frame.expect("close frame without payload");
            return (u16::from(frame.code), frame.reason.as_str().to_string());
        }
    }
}

async fn authenticate(handle: &ServerHandle, client_id: &str) -> Socket {
    let (mut socket, _) = connect_async(handle.ws_url()).await.unwrap();

    let challenge = next_json(&mut socket).await;
    assert_eq!(challenge["event"], "connect.challenge");
    assert_eq!(challenge["payload"]["alg"], "hmac-sha256");
    let challenge_id = challenge["payload"]["challengeId"].as_str().unwrap();
    let nonce = challenge["payload"]["nonce"].as_str().unwrap();

    let claims = ConnectClaims {
        client_id: client_id.to_string(),
        role: Role::Interactive,
    };
    let response = sign_response(SECRET.as_bytes(), challenge_id, nonce, &claims).unwrap();
    let connect = json!({
        "type": "req",
        "id": "connect-1",
        "method": "connect",
        "params": {
            "minProtocol": PROTOCOL_VERSION,
            "maxProtocol": PROTOCOL_VERSION,
            "client": { "id": client_id, "version": "1.0.0", "platform": "linux", "mode": "cli" },
            "auth": { "challengeId": challenge_id, "response": response }
        }
    });
    socket
        .send(Message::text(connect.to_string()))
        .await
        .unwrap();

    let hello = response_for(&mut socket, "connect-1").await;
    assert_eq!(hello["ok"], true, "handshake failed: {hello}");
    assert_eq!(hello["payload"]["type"], "hello-ok");
    socket
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_endpoints() {
    let handle = start_gateway(gateway_config()).await;
    assert_ne!(handle.port(), 0);

    for path in ["/health", "/health/live"] {
        let resp = reqwest::get(format!("{}{path}", handle.base_url()))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["clients"], 0);
        assert!(body["version"].is_string());
        assert!(body["stateVersion"]["presence"].is_u64());
    }

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_and_rpc_over_socket() {
    let handle = start_gateway(gateway_config()).await;
    let mut socket = authenticate(&handle, "console").await;

    let request = json!({ "type": "req", "id": "h-1", "method": "health" });
    socket
        .send(Message::text(request.to_string()))
        .await
        .unwrap();
    let res = response_for(&mut socket, "h-1").await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["status"], "healthy");

    let body: Value = reqwest::get(format!("{}/health", handle.base_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["clients"], 1);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_presence_reaches_existing_client() {
    let handle = start_gateway(gateway_config()).await;
    let mut first = authenticate(&handle, "console-a").await;
    let _second = authenticate(&handle, "console-b").await;

    loop {
        let frame = next_json(&mut first).await;
        if frame["event"] != "presence" {
            continue;
        }
        let presence = frame["payload"]["presence"].as_array().unwrap();
        if presence.iter().any(|p| p["clientId"] == "console-b") {
            assert!(frame["stateVersion"]["presence"].as_u64().unwrap() >= 2);
            break;
        }
    }

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_origin_rejected_before_challenge() {
    let handle = start_gateway(WsServerConfig {
        allowed_origins: vec!["https://app.example.com".to_string()],
        ..gateway_config()
    })
    .await;

    let mut request = handle.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://evil.example.com"));
    let (mut socket, _) = connect_async(request).await.unwrap();

    match next_message(&mut socket).await {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1008);
            assert_eq!(frame.reason.as_str(), "origin not allowed");
        }
        other => panic!("expected close before any challenge, got {other:?}"),
    }

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_signature_closes_generically() {
    let handle = start_gateway(gateway_config()).await;
    let (mut socket, _) = connect_async(handle.ws_url()).await.unwrap();
    let challenge = next_json(&mut socket).await;
    let challenge_id = challenge["payload"]["challengeId"].as_str().unwrap();

    let connect = json!({
        "type": "req",
        "id": "connect-1",
        "method": "connect",
        "params": {
            "minProtocol": PROTOCOL_VERSION,
            "maxProtocol": PROTOCOL_VERSION,
            "client": { "id": "intruder", "version": "1.0.0", "platform": "linux", "mode": "cli" },
            "auth": { "challengeId": challenge_id, "response": "not-a-signature" }
        }
    });
    socket
        .send(Message::text(connect.to_string()))
        .await
        .unwrap();

    let res = response_for(&mut socket, "connect-1").await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "NOT_AUTHORIZED");
    assert_eq!(res["error"]["message"], "authentication failed");
    assert_eq!(
        expect_close(&mut socket).await,
        (1008, "authentication failed".to_string())
    );

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_clients_with_1012() {
    let handle = start_gateway(gateway_config()).await;
    let mut socket = authenticate(&handle, "console").await;
    let ws_state = handle.ws_state().clone();

    let shutdown = tokio::spawn(handle.shutdown());

    let mut saw_shutdown_event = false;
    let (code, reason) = loop {
        match next_message(&mut socket).await {
            Message::Text(text) => {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                if frame["event"] == "shutdown" {
                    saw_shutdown_event = true;
                }
            }
            Message::Close(Some(frame)) => {
                break (u16::from(frame.code), frame.reason.as_str().to_string())
            }
            _ => {}
        }
    };
    assert!(saw_shutdown_event);
    assert_eq!(code, 1012);
    assert_eq!(reason, "server shutdown");

    shutdown.await.unwrap();
    assert!(ws_state.is_shutting_down());
    assert_eq!(ws_state.client_count(), 0);
}

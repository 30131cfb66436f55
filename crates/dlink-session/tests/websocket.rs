//! Integration tests for the session client against a mock Axum WebSocket
//! server speaking the Deribit JSON-RPC dialect.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use dlink_core::{SessionEvent, SessionState};
use dlink_session::{Credentials, HttpFormPoster, SessionClient, SessionConfig, WsConnector};
use serde_json::{json, Value};

const BOOK: &str = "book.BTC-PERPETUAL.100ms";

// ------------------------------------------------------------------------------------------------
// Test Server State
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
struct TestServerState {
    connection_count: AtomicUsize,
    auth_requests: tokio::sync::Mutex<Vec<Value>>,
    subscriptions: tokio::sync::Mutex<Vec<String>>,
    heartbeat_interval: tokio::sync::Mutex<Option<u64>>,
    test_response_count: AtomicUsize,
    reject_auth: AtomicBool,
    close_after_subscribe: AtomicBool,
}

// ------------------------------------------------------------------------------------------------
// Mock WebSocket Handler
// ------------------------------------------------------------------------------------------------

async fn handle_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<TestServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_json(socket: &mut WebSocket, value: Value) -> bool {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .is_ok()
}

async fn handle_socket(mut socket: WebSocket, state: Arc<TestServerState>) {
    state.connection_count.fetch_add(1, Ordering::SeqCst);

    while let Some(Ok(message)) = socket.recv().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(payload) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let id = payload.get("id").cloned().unwrap_or(Value::Null);
        let params = payload.get("params").cloned().unwrap_or(Value::Null);

        let keep_going = match payload.get("method").and_then(Value::as_str) {
            Some("public/auth") => {
                state.auth_requests.lock().await.push(params.clone());
                let response = if state.reject_auth.load(Ordering::SeqCst) {
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": 13004, "message": "invalid_credentials"},
                        "testnet": true,
                    })
                } else {
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "access_token": "tok1",
                            "refresh_token": "ref1",
                            "expires_in": 900,
                            "scope": "connection mainaccount",
                            "token_type": "bearer",
                        },
                        "testnet": true,
                        "usIn": 1699999999000000_u64,
                        "usOut": 1699999999001000_u64,
                    })
                };
                send_json(&mut socket, response).await
            }
            Some("public/set_heartbeat") => {
                *state.heartbeat_interval.lock().await = params["interval"].as_u64();
                send_json(
                    &mut socket,
                    json!({"jsonrpc": "2.0", "id": id, "result": "ok", "testnet": true}),
                )
                .await
                    && send_json(
                        &mut socket,
                        json!({
                            "jsonrpc": "2.0",
                            "method": "heartbeat",
                            "params": {"type": "test_request"},
                        }),
                    )
                    .await
            }
            Some("public/test") => {
                state.test_response_count.fetch_add(1, Ordering::SeqCst);
                send_json(
                    &mut socket,
                    json!({"jsonrpc": "2.0", "id": id, "result": {"version": "1.2.26"}}),
                )
                .await
            }
            Some("public/subscribe") => {
                let channels: Vec<String> = params["channels"]
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                state
                    .subscriptions
                    .lock()
                    .await
                    .extend(channels.iter().cloned());

                let mut ok = send_json(
                    &mut socket,
                    json!({"jsonrpc": "2.0", "id": id, "result": channels, "testnet": true}),
                )
                .await;
                for channel in &channels {
                    ok = ok
                        && send_json(
                            &mut socket,
                            json!({
                                "jsonrpc": "2.0",
                                "method": "subscription",
                                "params": {
                                    "channel": channel,
                                    "data": {"change_id": 1, "bids": [["new", 100.0, 10.0]]},
                                },
                            }),
                        )
                        .await;
                }

                if state.close_after_subscribe.load(Ordering::SeqCst) {
                    let _ = socket.send(Message::Close(None)).await;
                    false
                } else {
                    ok
                }
            }
            _ => true,
        };

        if !keep_going {
            break;
        }
    }

    state.connection_count.fetch_sub(1, Ordering::SeqCst);
}

async fn start_ws_server(state: Arc<TestServerState>) -> SocketAddr {
    let router = Router::new()
        .route("/ws/api/v2", get(handle_ws_upgrade))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind websocket listener");
    let addr = listener.local_addr().expect("missing local addr");

    tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("websocket server failed");
    });

    addr
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn start_client(addr: SocketAddr, channels: &[&str]) -> SessionClient {
    let config = SessionConfig::new(
        format!("ws://{addr}/ws/api/v2"),
        Credentials::new("test-key", "test-secret"),
    )
    .with_channels(channels.iter().copied());
    SessionClient::start(config, WsConnector, HttpFormPoster::default())
}

async fn wait_for_event<F>(client: &mut SessionClient, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = client
                .event_receiver()
                .recv()
                .await
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until<F>(mut condition: F, timeout: Duration)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

// ================================================================================================
// Tests
// ================================================================================================

#[tokio::test]
async fn test_full_session_flow() {
    let state = Arc::new(TestServerState::default());
    let addr = start_ws_server(state.clone()).await;
    let mut client = start_client(addr, &[BOOK]);

    let event = wait_for_event(&mut client, |e| matches!(e, SessionEvent::Authenticated { .. })).await;
    // Testnet tokens get the fixed lifetime regardless of expires_in.
    assert!(matches!(
        event,
        SessionEvent::Authenticated { refreshed: false, valid_for_secs: 300 }
    ));
    assert_eq!(client.state(), SessionState::Authenticated);

    let event = wait_for_event(&mut client, |e| matches!(e, SessionEvent::Subscribed { .. })).await;
    assert!(matches!(event, SessionEvent::Subscribed { channels } if channels == vec![BOOK]));

    let event = wait_for_event(&mut client, |e| e.channel().is_some()).await;
    match event {
        SessionEvent::Notification { channel, data } => {
            assert_eq!(channel, BOOK);
            assert_eq!(data["change_id"], 1);
        }
        other => panic!("Expected Notification, got {:?}", other),
    }

    let auth = state.auth_requests.lock().await.clone();
    assert_eq!(auth.len(), 1);
    assert_eq!(auth[0]["grant_type"], "client_credentials");
    assert_eq!(auth[0]["client_id"], "test-key");
    assert_eq!(*state.heartbeat_interval.lock().await, Some(10));

    let server = state.clone();
    wait_until(
        move || server.test_response_count.load(Ordering::SeqCst) >= 1,
        Duration::from_secs(2),
    )
    .await;

    client.shutdown().await.expect("shutdown failed");
    let server = state.clone();
    wait_until(
        move || server.connection_count.load(Ordering::SeqCst) == 0,
        Duration::from_secs(2),
    )
    .await;
}

#[tokio::test]
async fn test_runtime_subscribe_reaches_server() {
    let state = Arc::new(TestServerState::default());
    let addr = start_ws_server(state.clone()).await;
    let mut client = start_client(addr, &[]);

    wait_for_event(&mut client, |e| matches!(e, SessionEvent::Authenticated { .. })).await;
    client
        .subscribe(vec!["trades.BTC-PERPETUAL.raw".to_string()])
        .await
        .expect("subscribe failed");

    wait_for_event(&mut client, |e| matches!(e, SessionEvent::Subscribed { .. })).await;
    assert_eq!(
        *state.subscriptions.lock().await,
        vec!["trades.BTC-PERPETUAL.raw".to_string()]
    );
}

#[tokio::test]
async fn test_rejected_credentials_fail_session() {
    let state = Arc::new(TestServerState::default());
    state.reject_auth.store(true, Ordering::SeqCst);
    let addr = start_ws_server(state.clone()).await;
    let mut client = start_client(addr, &[BOOK]);

    let event = wait_for_event(&mut client, |e| matches!(e, SessionEvent::Closed { .. })).await;
    assert!(matches!(event, SessionEvent::Closed { reason } if reason.contains("invalid_credentials")));
    assert_eq!(client.state(), SessionState::Failed);
    assert!(state.subscriptions.lock().await.is_empty());
}

#[tokio::test]
async fn test_server_close_fails_session() {
    let state = Arc::new(TestServerState::default());
    state.close_after_subscribe.store(true, Ordering::SeqCst);
    let addr = start_ws_server(state.clone()).await;
    let mut client = start_client(addr, &[BOOK]);

    wait_for_event(&mut client, |e| matches!(e, SessionEvent::Subscribed { .. })).await;
    let event = wait_for_event(&mut client, |e| matches!(e, SessionEvent::Closed { .. })).await;
    assert!(matches!(event, SessionEvent::Closed { reason } if reason.contains("Connection closed")));
    assert_eq!(client.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_connect_refused_fails_session() {
    // Bind then drop to get a port nobody listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("missing local addr");
    drop(listener);

    let mut client = start_client(addr, &[BOOK]);
    let event = wait_for_event(&mut client, |e| matches!(e, SessionEvent::Closed { .. })).await;
    assert!(matches!(event, SessionEvent::Closed { reason } if reason.contains("Failed to connect")));
    assert_eq!(client.state(), SessionState::Failed);
}

//! End-to-end test driving the relay server over a real WebSocket, the way
//! the daemon's own `tests/health.rs` spins up its HTTP server on a random
//! port and talks to it as a client would.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use studio_relay::auth::issue_token;
use studio_relay::config::RelayServerConfig;
use studio_relay::crypto::{derive_session, generate_keypair};
use studio_relay::server::admission::{build_router, AppState};
use studio_relay::server::router::ServerState;

/// Binds on an ephemeral port, starts the relay's axum app in the
/// background, and returns the port plus a JWT for `user_id` signed with
/// the same secret the server validates against.
async fn spawn_server(user_id: &str) -> (u16, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let dir = tempfile::tempdir().unwrap();
    let config = RelayServerConfig::new(
        Some(port),
        Some(dir.path().to_path_buf()),
        Some("error".to_string()),
        Some("test-secret".to_string()),
    );
    let token = issue_token(user_id, &config.jwt_secret, 3600).unwrap();

    let state = Arc::new(AppState {
        config,
        relay: ServerState::new(),
        started_at: Instant::now(),
    });
    let app = build_router(state);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    std::mem::forget(dir);

    // Give the listener a moment to accept connections.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (port, token)
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(
    port: u16,
    token: &str,
    device_type: &str,
    device_id: &str,
    device_name: &str,
) -> WsStream {
    let url = format!(
        "ws://127.0.0.1:{port}/ws/relay?token={token}&deviceType={device_type}&deviceId={device_id}&deviceName={device_name}"
    );
    let (stream, _response) = connect_async(&url).await.expect("connect failed");
    stream
}

async fn send_json(stream: &mut WsStream, value: Value) {
    stream.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv_json(stream: &mut WsStream) -> Value {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match stream.next().await.expect("stream closed").unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

#[tokio::test]
async fn happy_path_pair_then_encrypted_echo() {
    let (port, token) = spawn_server("user-1").await;

    let mut desktop = connect(port, &token, "desktop", "desktop-1", "Desk").await;
    let mut mobile = connect(port, &token, "mobile", "mobile-1", "Phone").await;

    // Mobile connects first in this test and gets its (empty) device list.
    let device_list = recv_json(&mut mobile).await;
    assert_eq!(device_list["type"], "device-list");

    let desktop_keys = generate_keypair();
    send_json(
        &mut desktop,
        json!({
            "type": "register-pairing",
            "pairingCode": "pairing-code-1",
            "publicKey": desktop_keys.public_hex,
            "deviceName": "Desk",
        }),
    )
    .await;

    let mobile_keys = generate_keypair();
    send_json(
        &mut mobile,
        json!({
            "type": "claim-pairing",
            "pairingCode": "pairing-code-1",
            "publicKey": mobile_keys.public_hex,
        }),
    )
    .await;

    let to_mobile = recv_json(&mut mobile).await;
    assert_eq!(to_mobile["type"], "pairing-accepted");
    assert_eq!(to_mobile["deviceId"], "desktop-1");
    assert_eq!(to_mobile["publicKey"], desktop_keys.public_hex);

    let to_desktop = recv_json(&mut desktop).await;
    assert_eq!(to_desktop["type"], "pairing-accepted");
    assert_eq!(to_desktop["deviceId"], "mobile-1");
    assert_eq!(to_desktop["publicKey"], mobile_keys.public_hex);

    let mut desktop_session =
        derive_session(&desktop_keys, &mobile_keys.public_hex, "pairing-code-1").unwrap();
    let mut mobile_session =
        derive_session(&mobile_keys, &desktop_keys.public_hex, "pairing-code-1").unwrap();
    assert_eq!(desktop_session.derived_key_hex(), mobile_session.derived_key_hex());

    let (payload, seq) = mobile_session.encrypt(b"hello desktop").unwrap();
    send_json(
        &mut mobile,
        json!({ "type": "relay", "to": "desktop-1", "payload": payload, "seq": seq }),
    )
    .await;

    let relayed = recv_json(&mut desktop).await;
    assert_eq!(relayed["type"], "relay");
    assert_eq!(relayed["from"], "mobile-1");
    let plaintext = desktop_session
        .decrypt(relayed["payload"].as_str().unwrap(), relayed["seq"].as_i64().unwrap())
        .unwrap();
    assert_eq!(plaintext, b"hello desktop");

    // Replaying the exact same frame a second time must be rejected locally.
    let replay_err = desktop_session.decrypt(
        relayed["payload"].as_str().unwrap(),
        relayed["seq"].as_i64().unwrap(),
    );
    assert!(replay_err.is_err());
}

#[tokio::test]
async fn claim_across_accounts_is_rejected_and_original_user_can_still_claim() {
    let (port, token_u1) = spawn_server("user-1").await;
    let token_u2 = issue_token("user-2", "test-secret", 3600).unwrap();

    let mut desktop = connect(port, &token_u1, "desktop", "desktop-1", "Desk").await;
    let mut mobile_u2 = connect(port, &token_u2, "mobile", "mobile-2", "Intruder").await;
    let _ = recv_json(&mut mobile_u2).await; // device-list

    let desktop_keys = generate_keypair();
    send_json(
        &mut desktop,
        json!({
            "type": "register-pairing",
            "pairingCode": "cross-account-code",
            "publicKey": desktop_keys.public_hex,
            "deviceName": "Desk",
        }),
    )
    .await;

    let intruder_keys = generate_keypair();
    send_json(
        &mut mobile_u2,
        json!({
            "type": "claim-pairing",
            "pairingCode": "cross-account-code",
            "publicKey": intruder_keys.public_hex,
        }),
    )
    .await;

    let rejection = recv_json(&mut mobile_u2).await;
    assert_eq!(rejection["type"], "error");
    assert_eq!(rejection["message"], "expired");

    // The legitimate owner can still claim with the same code afterwards —
    // the rejected cross-account attempt must not have consumed the offer.
    let mut mobile_u1 = connect(port, &token_u1, "mobile", "mobile-1", "Phone").await;
    let _ = recv_json(&mut mobile_u1).await; // device-list
    let legit_keys = generate_keypair();
    send_json(
        &mut mobile_u1,
        json!({
            "type": "claim-pairing",
            "pairingCode": "cross-account-code",
            "publicKey": legit_keys.public_hex,
        }),
    )
    .await;
    let result = recv_json(&mut mobile_u1).await;
    assert_eq!(result["type"], "pairing-accepted");
    assert_eq!(result["deviceId"], "desktop-1");
}

#[tokio::test]
async fn displacement_closes_prior_connection_for_same_device_id() {
    let (port, token) = spawn_server("user-1").await;

    let mut first = connect(port, &token, "desktop", "desktop-1", "Desk").await;
    let _second = connect(port, &token, "desktop", "desktop-1", "Desk").await;

    let closed = tokio::time::timeout(Duration::from_secs(2), first.next())
        .await
        .expect("timed out waiting for displacement close")
        .expect("stream ended without a message");
    match closed.unwrap() {
        Message::Close(frame) => {
            let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
            assert_eq!(reason, "replaced");
        }
        other => panic!("expected a close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn displacement_does_not_tell_the_paired_peer_the_device_went_offline() {
    let (port, token) = spawn_server("user-1").await;

    let mut desktop = connect(port, &token, "desktop", "desktop-1", "Desk").await;
    let mut mobile = connect(port, &token, "mobile", "mobile-1", "Phone").await;
    let _ = recv_json(&mut mobile).await; // device-list

    let desktop_keys = generate_keypair();
    send_json(
        &mut desktop,
        json!({
            "type": "register-pairing",
            "pairingCode": "displacement-code",
            "publicKey": desktop_keys.public_hex,
            "deviceName": "Desk",
        }),
    )
    .await;
    send_json(
        &mut mobile,
        json!({
            "type": "claim-pairing",
            "pairingCode": "displacement-code",
            "publicKey": generate_keypair().public_hex,
        }),
    )
    .await;
    let _ = recv_json(&mut mobile).await; // pairing-accepted
    let _ = recv_json(&mut desktop).await; // pairing-accepted

    // A second desktop connection with the same device id displaces the
    // first. The mobile, still paired with "desktop-1", must not see a
    // device-offline for it — the device is still present, just on a
    // different socket.
    let _second_desktop = connect(port, &token, "desktop", "desktop-1", "Desk").await;

    let spurious = tokio::time::timeout(Duration::from_millis(300), mobile.next()).await;
    assert!(spurious.is_err(), "mobile should not receive any frame on displacement");
}

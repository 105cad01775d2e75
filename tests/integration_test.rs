// tests/integration_test.rs

//! End-to-end tests that spin up a real hub server and connect real hub
//! clients against it over a loopback socket, exercising the handshake,
//! presence bookkeeping, command fan-out, and invalid-token rejection.

use hikari_fleet::config::FleetConfig;
use hikari_fleet::ipc::{CallbackResult, HubClient, HubClientConfig};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

fn test_config(port: u16, token: &str) -> FleetConfig {
    FleetConfig {
        host: "127.0.0.1".to_string(),
        port,
        token: token.to_string(),
        certificate_path: None,
        total_servers: 1,
        clusters_per_server: 1,
        shards_per_cluster: 1,
        log_level: "error".to_string(),
    }
}

/// Grabs a free loopback port by binding to port 0 and releasing it. Tiny
/// race window, but good enough for a test harness.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn spawn_hub(token: &str) -> String {
    let port = free_port().await;
    let config = test_config(port, token);
    tokio::spawn(hikari_fleet::hub::run(config));
    // Give the listener a moment to bind before clients dial in.
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

async fn wait_for_uid(client: &HubClient) -> u32 {
    for _ in 0..100 {
        let uid = client.uid();
        if uid != 0 {
            return uid;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("client never completed handshake");
}

#[tokio::test]
async fn handshake_sees_previously_connected_peer() {
    let uri = spawn_hub("secret-token").await;

    let mut client_a = HubClient::new(HubClientConfig {
        uri: uri.clone(),
        token: "secret-token".to_string(),
        reconnect: false,
    });
    let handle_a = client_a.clone();
    tokio::spawn(async move {
        let _ = client_a.run().await;
    });
    let uid_a = wait_for_uid(&handle_a).await;

    let mut client_b = HubClient::new(HubClientConfig {
        uri,
        token: "secret-token".to_string(),
        reconnect: false,
    });
    let handle_b = client_b.clone();
    tokio::spawn(async move {
        let _ = client_b.run().await;
    });
    wait_for_uid(&handle_b).await;

    assert!(handle_b.client_uids().contains(&uid_a));
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let uri = spawn_hub("right-token").await;

    let mut client = HubClient::new(HubClientConfig {
        uri,
        token: "wrong-token".to_string(),
        reconnect: false,
    });
    let result = client.run().await;
    assert!(matches!(result, Err(hikari_fleet::error::FleetError::InvalidIpcToken)));
}

#[tokio::test]
async fn wrong_token_fails_fast_even_with_reconnect_enabled() {
    let uri = spawn_hub("right-token").await;

    let mut client = HubClient::new(HubClientConfig {
        uri,
        token: "wrong-token".to_string(),
        reconnect: true,
    });
    // With a real transient disconnect this would retry forever; an
    // invalid token must not be treated as transient.
    let result = tokio::time::timeout(Duration::from_secs(5), client.run())
        .await
        .expect("invalid token must fail fast instead of entering the reconnect loop");
    assert!(matches!(result, Err(hikari_fleet::error::FleetError::InvalidIpcToken)));
}

#[tokio::test]
async fn command_round_trips_between_two_clients() {
    let uri = spawn_hub("secret-token").await;

    let mut client_a = HubClient::new(HubClientConfig {
        uri: uri.clone(),
        token: "secret-token".to_string(),
        reconnect: false,
    });
    client_a
        .commands()
        .add("ping", Arc::new(|_author, data: Value| async move { Ok(data) }))
        .unwrap();
    let handle_a = client_a.clone();
    tokio::spawn(async move {
        let _ = client_a.run().await;
    });
    let uid_a = wait_for_uid(&handle_a).await;

    let mut client_b = HubClient::new(HubClientConfig {
        uri,
        token: "secret-token".to_string(),
        reconnect: false,
    });
    let handle_b = client_b.clone();
    tokio::spawn(async move {
        let _ = client_b.run().await;
    });
    wait_for_uid(&handle_b).await;

    let responses = handle_b
        .send_command(&[uid_a], "ping", json!({"echo": 42}))
        .await
        .unwrap();

    match responses.get(&uid_a) {
        Some(CallbackResult::Ok(value)) => assert_eq!(value, &json!({"echo": 42})),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn command_to_disconnected_peer_reports_no_response() {
    let uri = spawn_hub("secret-token").await;

    let mut client_a = HubClient::new(HubClientConfig {
        uri: uri.clone(),
        token: "secret-token".to_string(),
        reconnect: false,
    });
    let handle_a = client_a.clone();
    let run_handle = tokio::spawn(async move {
        let _ = client_a.run().await;
    });
    let uid_a = wait_for_uid(&handle_a).await;

    let mut client_b = HubClient::new(HubClientConfig {
        uri,
        token: "secret-token".to_string(),
        reconnect: false,
    });
    let handle_b = client_b.clone();
    tokio::spawn(async move {
        let _ = client_b.run().await;
    });
    wait_for_uid(&handle_b).await;

    // Kill A's connection before B's request resolves.
    run_handle.abort();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let responses = handle_b
        .send_command_timeout(&[uid_a], "ping", Value::Null, Duration::from_secs(2))
        .await
        .unwrap();

    match responses.get(&uid_a) {
        Some(CallbackResult::NoResponse) => {}
        other => panic!("expected NoResponse, got {other:?}"),
    }
}

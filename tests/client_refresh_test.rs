// ============================================================================
// Client Refresh Coordinator Tests
// ============================================================================
//
// The browser-side contract, exercised against a real gateway: concurrent
// 401s share exactly one refresh call, every original is retried exactly
// once, and a failed refresh logs every waiter out.
//
// ============================================================================

use std::sync::atomic::Ordering;

use quayside_gateway::client::{ClientError, GatewayClient};
use serde_json::json;

use test_utils::{spawn_gateway, spawn_gateway_with, RefreshMode};

#[tokio::test]
async fn concurrent_401s_share_a_single_refresh() {
    let app = spawn_gateway().await;
    let client = GatewayClient::new(app.url.clone());
    client.set_tokens("stale-token", "refresh-token").await;

    const CONCURRENCY: usize = 8;
    let mut handles = Vec::new();
    for _ in 0..CONCURRENCY {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.get("/api/containers").await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }

    // Exactly one refresh call for the whole wave.
    assert_eq!(app.refresh_calls.load(Ordering::SeqCst), 1);
    // Only the retried requests reached the backend: one per original.
    assert_eq!(app.docker_hits.load(Ordering::SeqCst), CONCURRENCY);
}

#[tokio::test]
async fn refresh_failure_propagates_to_every_waiter_and_logs_out() {
    let app = spawn_gateway_with(RefreshMode::Fail, |_| {}).await;
    let client = GatewayClient::new(app.url.clone());
    client.set_tokens("stale-token", "refresh-token").await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.get("/api/containers").await
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ClientError::SessionExpired(_))));
    }

    assert!(!client.is_logged_in().await, "failed refresh must clear the session");
    assert_eq!(app.refresh_calls.load(Ordering::SeqCst), 1);
    // No original ever reached the backend.
    assert_eq!(app.docker_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn a_401_on_the_retry_is_terminal() {
    let app = spawn_gateway_with(RefreshMode::ReturnInvalid, |_| {}).await;
    let client = GatewayClient::new(app.url.clone());
    client.set_tokens("stale-token", "refresh-token").await;

    let response = client.get("/api/containers").await.unwrap();

    // The retry's 401 comes back as-is instead of re-entering the protocol.
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(app.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(app.docker_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn public_endpoints_never_trigger_the_refresh_protocol() {
    let app = spawn_gateway().await;
    let client = GatewayClient::new(app.url.clone());
    client.set_tokens("stale-token", "refresh-token").await;

    // Wrong credentials produce a 401 from the credential store; the client
    // must hand it straight back rather than looping on refresh.
    let response = client
        .post(
            "/api/auth/login",
            json!({ "username": "alice", "password": "wrong" }),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(app.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn login_stores_tokens_and_requests_carry_them() {
    let app = spawn_gateway().await;
    let client = GatewayClient::new(app.url.clone());

    client.login("alice", "correct-horse").await.unwrap();
    assert!(client.is_logged_in().await);

    let response = client.get("/api/containers").await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["data"]["hasAuthorization"], true);

    // No refresh needed for a valid session.
    assert_eq!(app.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sequential_waves_each_get_their_own_refresh() {
    let app = spawn_gateway().await;
    let client = GatewayClient::new(app.url.clone());
    client.set_tokens("stale-token", "refresh-token").await;

    let response = client.get("/api/containers").await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(app.refresh_calls.load(Ordering::SeqCst), 1);

    // Invalidate again: a new failure wave starts a fresh refresh rather
    // than reusing the completed handle.
    client.set_tokens("stale-again", "refresh-token").await;
    let response = client.get("/api/containers").await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(app.refresh_calls.load(Ordering::SeqCst), 2);
}

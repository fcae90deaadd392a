// ============================================================================
// Auth Middleware & RBAC Authorizer Tests
// ============================================================================
//
// Every rejection must happen at the gateway with zero backend calls; every
// pass must reach exactly one backend.
//
// ============================================================================

use std::sync::atomic::Ordering;

use quayside_gateway::config::UnmappedRoutePolicy;
use quayside_gateway::rbac::Role;
use serde_json::json;

use test_utils::{bearer, mint_expired_token, mint_token, spawn_gateway, spawn_gateway_with, RefreshMode};

#[tokio::test]
async fn missing_token_is_401_and_backend_untouched() {
    let app = spawn_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/containers", app.url))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Missing or invalid authorization header");
    assert_eq!(app.docker_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_header_is_401() {
    let app = spawn_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/containers", app.url))
        .header("Authorization", "Basic abc123")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Missing or invalid authorization header");
    assert_eq!(app.docker_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_and_expired_tokens_are_401() {
    let app = spawn_gateway().await;
    let client = reqwest::Client::new();

    let expired = mint_expired_token(Role::Admin, "u-1");
    for token in ["garbage", expired.as_str()] {
        let response = client
            .get(format!("{}/api/containers", app.url))
            .header("Authorization", bearer(token))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Invalid or expired token");
    }
    assert_eq!(app.docker_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn viewer_cannot_start_containers() {
    let app = spawn_gateway().await;
    let client = reqwest::Client::new();
    let token = mint_token(Role::Viewer, "viewer-1");

    let response = client
        .post(format!("{}/api/containers/abc/start", app.url))
        .header("Authorization", bearer(&token))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Insufficient permissions");
    assert_eq!(app.docker_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn viewer_can_tail_logs() {
    let app = spawn_gateway().await;
    let client = reqwest::Client::new();
    let token = mint_token(Role::Viewer, "viewer-1");

    let response = client
        .get(format!("{}/api/containers/abc/logs", app.url))
        .header("Authorization", bearer(&token))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["data"]["path"], "/api/containers/abc/logs");
    assert_eq!(app.docker_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn operator_can_start_but_not_manage_users() {
    let app = spawn_gateway().await;
    let client = reqwest::Client::new();
    let token = mint_token(Role::Operator, "op-1");

    let start = client
        .post(format!("{}/api/containers/abc/start", app.url))
        .header("Authorization", bearer(&token))
        .send()
        .await
        .unwrap();
    assert_eq!(start.status(), reqwest::StatusCode::OK);

    let users = client
        .get(format!("{}/api/users", app.url))
        .header("Authorization", bearer(&token))
        .send()
        .await
        .unwrap();
    assert_eq!(users.status(), reqwest::StatusCode::FORBIDDEN);

    assert_eq!(app.docker_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn admin_can_mutate_settings() {
    let app = spawn_gateway().await;
    let client = reqwest::Client::new();
    let token = mint_token(Role::Admin, "admin-1");

    let response = client
        .put(format!("{}/api/settings", app.url))
        .header("Authorization", bearer(&token))
        .json(&json!({ "theme": "dark" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(app.docker_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn public_routes_bypass_authentication() {
    let app = spawn_gateway().await;
    let client = reqwest::Client::new();

    let status = client
        .get(format!("{}/api/auth/setup-status", app.url))
        .send()
        .await
        .unwrap();
    assert_eq!(status.status(), reqwest::StatusCode::OK);
    assert_eq!(app.docker_hits.load(Ordering::SeqCst), 1);

    let login = client
        .post(format!("{}/api/auth/login", app.url))
        .json(&json!({ "username": "alice", "password": "pw" }))
        .send()
        .await
        .unwrap();
    assert_eq!(login.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn health_is_served_by_the_gateway_itself() {
    let app = spawn_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/health", app.url))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
    // Never forwarded.
    assert_eq!(app.docker_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unmapped_routes_fail_open_by_default() {
    let app = spawn_gateway().await;
    let client = reqwest::Client::new();
    let token = mint_token(Role::Viewer, "viewer-1");

    let response = client
        .get(format!("{}/api/some-new-dashboard-endpoint", app.url))
        .header("Authorization", bearer(&token))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(app.docker_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unmapped_routes_reject_when_policy_is_deny() {
    let app = spawn_gateway_with(RefreshMode::Succeed, |config| {
        config.unmapped_route_policy = UnmappedRoutePolicy::Deny;
    })
    .await;
    let client = reqwest::Client::new();
    let token = mint_token(Role::Admin, "admin-1");

    let response = client
        .get(format!("{}/api/some-new-dashboard-endpoint", app.url))
        .header("Authorization", bearer(&token))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    assert_eq!(app.docker_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn security_headers_are_present_on_responses() {
    let app = spawn_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/health", app.url))
        .send()
        .await
        .unwrap();

    let headers = response.headers();
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
}

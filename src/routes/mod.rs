// ============================================================================
// Router Assembly
// ============================================================================
//
// Wires the public surface: the gateway's own health endpoint, the WebSocket
// session endpoints, and the catch-all relay, behind the pipeline middleware
// in fixed order (auth -> rbac -> rate limit -> audit -> proxy).
//
// ============================================================================

pub mod middleware;

use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::proxy;

/// Create the gateway router with the full middleware pipeline.
pub fn create_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // Gateway-owned liveness endpoint (exempt from auth and limiting)
        .route("/api/health", get(health))
        // Streaming sessions
        .route(
            "/api/containers/:id/logs/ws",
            get(proxy::ws::container_logs),
        )
        .route(
            "/api/containers/:id/exec/ws",
            get(proxy::ws::container_exec),
        )
        .route("/api/tunnels/:id/logs/ws", get(proxy::ws::tunnel_logs))
        // Everything else is relayed to its engine
        .fallback(proxy::relay)
        // Pipeline; first layer listed runs outermost.
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(middleware::request_logging))
                .layer(axum::middleware::from_fn(middleware::security_headers))
                .layer(axum::middleware::from_fn_with_state(
                    ctx.clone(),
                    middleware::authenticate,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    ctx.clone(),
                    middleware::authorize,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    ctx.clone(),
                    middleware::rate_limit,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    ctx.clone(),
                    middleware::audit_intent,
                )),
        )
        .with_state(ctx)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": { "status": "ok" },
    }))
}

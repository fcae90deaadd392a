// ============================================================================
// Gateway Pipeline Middleware
// ============================================================================
//
// The fixed-order pipeline every request walks before it may reach a backend:
// auth -> rbac -> rate limit -> audit -> proxy. Each stage owns its failure
// class and replies directly, short-circuiting the rest of the pipeline. A
// backend call happens if and only if every stage passed.
//
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::auth::{bearer_token, is_public_route, Principal};
use crate::config::MAX_BUFFERED_AUTH_BODY;
use crate::context::AppContext;
use crate::error::GatewayError;
use crate::proxy::{is_https, Engine};
use crate::ratelimit::{Policy, Snapshot};
use crate::utils::{extract_client_ip, extract_sub_unverified, is_websocket_upgrade};

/// Request logging middleware.
pub async fn request_logging(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    tracing::debug!(method = %method, path = %path, "Incoming request");

    let response = next.run(req).await;

    let duration = start.elapsed();
    tracing::info!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        duration_ms = duration.as_millis(),
        request_id = request_id.as_deref(),
        "Request completed"
    );

    response
}

/// Adds baseline security headers to every response.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let https = is_https(req.headers());
    let mut response = next.run(req).await;
    crate::utils::add_security_headers(response.headers_mut(), https);
    response
}

/// Auth Middleware: verifies bearer tokens and attaches the caller identity.
///
/// Allow-list routes pass with no Principal. WebSocket handshakes pass too:
/// their token travels out-of-band and the upgrade handler re-verifies it
/// with the same verifier before any backend socket opens.
pub async fn authenticate(
    State(ctx): State<Arc<AppContext>>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let path = req.uri().path().to_string();
    if is_public_route(&path) || is_websocket_upgrade(req.headers()) {
        return Ok(next.run(req).await);
    }

    let method = req.method().clone();
    let client_ip = client_ip_of(&req);

    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    let token = match token {
        Some(token) => token,
        None => {
            ctx.audit.record_authentication_failure(
                &client_ip,
                method.as_str(),
                &path,
                "missing or malformed Authorization header",
            );
            return Err(GatewayError::Unauthenticated(
                "Missing or invalid authorization header".to_string(),
            ));
        }
    };

    let principal = match ctx.verifier.verify(token) {
        Ok(principal) => principal,
        Err(err) => {
            ctx.audit.record_authentication_failure(
                &client_ip,
                method.as_str(),
                &path,
                "token verification failed",
            );
            return Err(err);
        }
    };

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

/// RBAC Authorizer: resolves the required permission for the route and checks
/// it against the caller's role.
pub async fn authorize(
    State(ctx): State<Arc<AppContext>>,
    req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let path = req.uri().path();
    if path.starts_with("/api/auth/") || path == "/api/health" || is_websocket_upgrade(req.headers())
    {
        return Ok(next.run(req).await);
    }

    let principal = req.extensions().get::<Principal>().cloned().ok_or_else(|| {
        GatewayError::Unauthenticated("Missing or invalid authorization header".to_string())
    })?;

    let allowed = ctx.routes.authorize(
        principal.role,
        req.method(),
        path,
        ctx.config.unmapped_route_policy,
    );

    if !allowed {
        tracing::warn!(
            role = principal.role.as_str(),
            method = %req.method(),
            path = %path,
            "Permission denied"
        );
        return Err(GatewayError::Forbidden("Insufficient permissions".to_string()));
    }

    Ok(next.run(req).await)
}

/// One limiter layer's verdict material.
#[derive(Debug, Clone, Copy)]
struct LayerOutcome {
    name: &'static str,
    policy: Policy,
    snapshot: Snapshot,
}

impl LayerOutcome {
    fn new(name: &'static str, policy: Policy, snapshot: Snapshot) -> Self {
        Self {
            name,
            policy,
            snapshot,
        }
    }

    fn breached(&self) -> bool {
        self.snapshot.count > self.policy.max_requests
    }

    fn remaining(&self) -> u32 {
        self.policy
            .max_requests
            .saturating_sub(self.snapshot.count)
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, outcome: &LayerOutcome) {
    let limit = outcome.policy.max_requests.to_string();
    let remaining = outcome.remaining().to_string();
    let reset = (outcome.snapshot.reset_at_ms / 1000).to_string();
    if let Ok(value) = HeaderValue::from_str(&limit) {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining) {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&reset) {
        headers.insert("X-RateLimit-Reset", value);
    }
}

fn is_mutating(method: &Method) -> bool {
    *method == Method::POST
        || *method == Method::PUT
        || *method == Method::PATCH
        || *method == Method::DELETE
}

/// Heavy operations: mutating verbs against resource-intensive backend
/// actions (builds, compose, tunnels, image pulls).
fn is_heavy_operation(method: &Method, path: &str) -> bool {
    if !is_mutating(method) {
        return false;
    }
    path.starts_with("/api/builds")
        || path.starts_with("/api/compose")
        || path.starts_with("/api/tunnels")
        || path == "/api/images/pull"
}

/// Layered rate limiters. Additive: one request may be checked by several
/// policies, and any breach rejects with 429 before the proxy runs.
/// `X-RateLimit-*` headers are set win or lose from the governing policy
/// (the breaching layer, or the layer with the fewest requests remaining).
pub async fn rate_limit(
    State(ctx): State<Arc<AppContext>>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let path = req.uri().path().to_string();
    if path == "/api/health" || is_websocket_upgrade(req.headers()) {
        return Ok(next.run(req).await);
    }

    let method = req.method().clone();
    let client_ip = client_ip_of(&req);
    let principal = req.extensions().get::<Principal>().cloned();
    let policies = ctx.policies;

    let mut outcomes: Vec<LayerOutcome> = Vec::new();

    // Layer 1: general tier - role-tiered for authenticated callers,
    // per-IP for anonymous ones.
    match &principal {
        Some(p) => {
            let policy = policies.for_role(p.role);
            let snapshot = ctx
                .ledger
                .increment(&format!("user:{}", p.id), policy.window);
            outcomes.push(LayerOutcome::new("general", policy, snapshot));
        }
        None => {
            let policy = policies.anonymous;
            let snapshot = ctx
                .ledger
                .increment(&format!("ip:{client_ip}"), policy.window);
            outcomes.push(LayerOutcome::new("anonymous", policy, snapshot));
        }
    }

    // Layer 2: endpoint-class policies.
    if method == Method::POST && path == "/api/auth/login" {
        let policy = policies.login;

        // The login limiter keys on both the IP and an ip+username composite,
        // defending one account across IPs while still IP-limiting. The
        // username requires a peek at the (small) JSON body.
        let (parts, body) = req.into_parts();
        let bytes = axum::body::to_bytes(body, MAX_BUFFERED_AUTH_BODY)
            .await
            .map_err(|e| GatewayError::Internal(format!("Failed to read request body: {e}")))?;
        let username = serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .and_then(|v| {
                v.get("username")
                    .and_then(|u| u.as_str())
                    .map(|u| u.to_string())
            });
        req = Request::from_parts(parts, Body::from(bytes));

        let ip_snapshot = ctx
            .ledger
            .increment(&format!("login:ip:{client_ip}"), policy.window);
        let governing = match username {
            Some(username) => {
                let account_snapshot = ctx.ledger.increment(
                    &format!("login:acct:{client_ip}:{username}"),
                    policy.window,
                );
                // The larger count governs.
                if account_snapshot.count > ip_snapshot.count {
                    account_snapshot
                } else {
                    ip_snapshot
                }
            }
            None => ip_snapshot,
        };
        outcomes.push(LayerOutcome::new("login", policy, governing));
    } else if method == Method::POST && path == "/api/auth/setup" {
        let policy = policies.setup;
        let snapshot = ctx
            .ledger
            .increment(&format!("setup:ip:{client_ip}"), policy.window);
        outcomes.push(LayerOutcome::new("setup", policy, snapshot));
    } else if method == Method::POST && path == "/api/auth/refresh" {
        let policy = policies.refresh;
        // Key on the account being refreshed when the caller presented a
        // token (possibly expired; unverified decode is for keying only),
        // else on the IP.
        let key = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .and_then(extract_sub_unverified)
            .map(|sub| format!("refresh:user:{sub}"))
            .unwrap_or_else(|| format!("refresh:ip:{client_ip}"));
        let snapshot = ctx.ledger.increment(&key, policy.window);
        outcomes.push(LayerOutcome::new("refresh", policy, snapshot));
    } else if is_heavy_operation(&method, &path) {
        let policy = policies.heavy;
        let key = match &principal {
            Some(p) => format!("heavy:user:{}", p.id),
            None => format!("heavy:ip:{client_ip}"),
        };
        let snapshot = ctx.ledger.increment(&key, policy.window);
        outcomes.push(LayerOutcome::new("heavy", policy, snapshot));
    }

    // Any breach rejects; the proxy never runs.
    if let Some(breach) = outcomes.iter().find(|o| o.breached()) {
        let retry_after = breach.snapshot.retry_after_secs(unix_ms());

        ctx.audit.record_rate_limit_violation(
            principal.as_ref(),
            &client_ip,
            method.as_str(),
            &path,
            breach.name,
            breach.snapshot.count,
            breach.policy.max_requests,
        );
        tracing::warn!(
            limiter = breach.name,
            ip = %client_ip,
            count = breach.snapshot.count,
            limit = breach.policy.max_requests,
            path = %path,
            "Rate limit exceeded"
        );

        let err = GatewayError::RateLimited {
            message: format!(
                "Too many requests. Try again in {retry_after} seconds."
            ),
            retry_after_secs: retry_after,
        };
        let mut response = err.into_response();
        apply_rate_limit_headers(response.headers_mut(), breach);
        return Ok(response);
    }

    // Governing policy on success: the layer closest to its limit.
    let governing = outcomes
        .iter()
        .min_by_key(|o| o.remaining())
        .copied();

    let mut response = next.run(req).await;
    if let Some(governing) = governing {
        apply_rate_limit_headers(response.headers_mut(), &governing);
    }
    Ok(response)
}

/// Audit Hook: records the intent of every mutating call before it is
/// relayed. Fire-and-forget; never fails the request.
pub async fn audit_intent(
    State(ctx): State<Arc<AppContext>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method();
    let path = req.uri().path();
    if is_mutating(method) && path != "/api/health" {
        let engine = Engine::for_path(path);
        let client_ip = client_ip_of(&req);
        let principal = req.extensions().get::<Principal>();
        ctx.audit.record_intent(
            principal,
            &client_ip,
            method.as_str(),
            path,
            engine.name(),
        );
    }
    next.run(req).await
}

fn client_ip_of(req: &Request) -> String {
    let direct_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());
    extract_client_ip(req.headers(), direct_ip)
}

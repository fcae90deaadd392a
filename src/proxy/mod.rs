// ============================================================================
// Request Proxy
// ============================================================================
//
// Forwards already-authorized HTTP requests to the resolved backend engine,
// streaming both directions. No retries: retry policy belongs to the backend
// or the caller, which can reason about idempotency; the gateway cannot.
//
// ============================================================================

pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, Response};
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{GatewayError, GatewayResult};

/// The internal backends the gateway fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    DockerControl,
    TunnelControl,
}

impl Engine {
    /// Resolve the backend for a request path. Tunnel traffic has its own
    /// engine; everything else belongs to the docker-control engine.
    pub fn for_path(path: &str) -> Self {
        if path.starts_with("/api/tunnels") {
            Engine::TunnelControl
        } else {
            Engine::DockerControl
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Engine::DockerControl => "docker-control",
            Engine::TunnelControl => "tunnel-control",
        }
    }

    pub fn base_url<'a>(&self, config: &'a crate::config::Config) -> &'a str {
        match self {
            Engine::DockerControl => &config.docker_engine_url,
            Engine::TunnelControl => &config.tunnel_engine_url,
        }
    }
}

// Hop-by-hop fields are connection-scoped and must not cross the relay.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// HTTP client for relaying requests to the engines.
pub struct ProxyClient {
    client: reqwest::Client,
    /// Time allowed until the backend produces response headers. Bodies
    /// stream without a deadline so log tails stay alive.
    timeout: Duration,
}

impl ProxyClient {
    pub fn new(timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Forward a request to `base_url`, preserving method, path, query,
    /// headers (minus hop-by-hop fields) and body, and stream the backend's
    /// response back verbatim.
    pub async fn forward(
        &self,
        base_url: &str,
        engine: Engine,
        request: Request,
    ) -> GatewayResult<Response<Body>> {
        let path = request.uri().path();
        let target_url = match request.uri().query() {
            Some(query) => format!("{base_url}{path}?{query}"),
            None => format!("{base_url}{path}"),
        };

        let method = request.method().clone();
        let headers = request.headers().clone();
        let (_parts, body) = request.into_parts();

        let mut upstream_request = self
            .client
            .request(method, &target_url)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()));

        for (name, value) in headers.iter() {
            // Host is set by the client; content-length is recomputed for the
            // streamed body.
            if is_hop_by_hop(name) || name.as_str() == "host" || name.as_str() == "content-length" {
                continue;
            }
            upstream_request = upstream_request.header(name, value);
        }

        if !headers.contains_key("x-request-id") {
            upstream_request =
                upstream_request.header("x-request-id", Uuid::new_v4().to_string());
        }

        let send = upstream_request.send();
        let upstream_response = match tokio::time::timeout(self.timeout, send).await {
            Err(_) => {
                tracing::warn!(
                    engine = engine.name(),
                    target_url = %target_url,
                    timeout_secs = self.timeout.as_secs(),
                    "Backend did not respond before the deadline"
                );
                return Err(GatewayError::GatewayTimeout(format!(
                    "{} did not respond within {}s",
                    engine.name(),
                    self.timeout.as_secs()
                )));
            }
            Ok(Err(e)) if e.is_timeout() => {
                tracing::warn!(engine = engine.name(), error = %e, "Backend timed out");
                return Err(GatewayError::GatewayTimeout(e.to_string()));
            }
            Ok(Err(e)) => {
                tracing::error!(
                    engine = engine.name(),
                    target_url = %target_url,
                    error = %e,
                    "Failed to forward request to backend"
                );
                return Err(GatewayError::BadGateway(e.to_string()));
            }
            Ok(Ok(response)) => response,
        };

        let status = upstream_response.status();
        let mut builder = Response::builder().status(status);
        for (name, value) in upstream_response.headers().iter() {
            if !is_hop_by_hop(name) {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from_stream(upstream_response.bytes_stream()))
            .map_err(|e| GatewayError::Internal(format!("Failed to build response: {e}")))
    }
}

/// Fallback handler: every request that survived the pipeline is relayed to
/// its engine.
pub async fn relay(
    State(ctx): State<Arc<AppContext>>,
    request: Request,
) -> GatewayResult<Response<Body>> {
    let engine = Engine::for_path(request.uri().path());
    let base_url = engine.base_url(&ctx.config).to_string();
    ctx.proxy.forward(&base_url, engine, request).await
}

/// True when the request arrived over HTTPS according to the terminating
/// proxy.
pub fn is_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "https")
        .unwrap_or(false)
}

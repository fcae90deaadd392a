// ============================================================================
// WebSocket Proxy
// ============================================================================
//
// Upgrades inbound connections for streaming sessions (log tails, exec,
// tunnel logs) and relays frames to the engine's own socket endpoint.
//
// Browsers cannot attach custom headers to a WebSocket handshake, so the
// token travels as a `?token=` query parameter and is verified with the same
// verifier as the HTTP pipeline. Authentication failures reject the upgrade
// before any backend socket is opened.
//
// ============================================================================

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::auth::{bearer_token, Principal};
use crate::context::AppContext;
use crate::error::GatewayError;
use crate::proxy::Engine;
use crate::utils::log_safe_id;

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// GET /api/containers/:id/logs/ws
pub async fn container_logs(
    State(ctx): State<Arc<AppContext>>,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    proxy_upgrade(ctx, ws, uri, headers, "containers:logs").await
}

/// GET /api/containers/:id/exec/ws
pub async fn container_exec(
    State(ctx): State<Arc<AppContext>>,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    proxy_upgrade(ctx, ws, uri, headers, "containers:exec").await
}

/// GET /api/tunnels/:id/logs/ws
pub async fn tunnel_logs(
    State(ctx): State<Arc<AppContext>>,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    proxy_upgrade(ctx, ws, uri, headers, "tunnels:logs").await
}

/// Authenticate the handshake, open the paired backend socket, then upgrade
/// and relay until either side closes.
async fn proxy_upgrade(
    ctx: Arc<AppContext>,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
    required_permission: &'static str,
) -> Response {
    let path = uri.path().to_string();

    let principal = match authenticate_handshake(&ctx, &uri, &headers) {
        Ok(principal) => principal,
        Err(err) => return err.into_response(),
    };

    if !principal.role.has_permission(required_permission) {
        return GatewayError::Forbidden("Insufficient permissions".to_string()).into_response();
    }

    let engine = Engine::for_path(&path);
    let backend_url = backend_ws_url(engine.base_url(&ctx.config), &uri);

    // The backend socket opens before the client upgrade completes, so a dead
    // backend surfaces as an HTTP error rather than an immediate close.
    let upstream = match connect_async(backend_url.as_str()).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            tracing::error!(
                engine = engine.name(),
                backend_url = %backend_url,
                error = %e,
                "Failed to open backend WebSocket"
            );
            return GatewayError::BadGateway(e.to_string()).into_response();
        }
    };

    let actor = log_safe_id(&principal.id, &ctx.config.log_hash_salt);
    tracing::info!(
        actor_hash = %actor,
        engine = engine.name(),
        path = %path,
        "WebSocket session opened"
    );

    ws.on_upgrade(move |client| async move {
        relay_frames(client, upstream).await;
        tracing::info!(actor_hash = %actor, path = %path, "WebSocket session closed");
    })
}

/// Same verification as the HTTP auth middleware, fed from the alternate
/// channel: `?token=` first, Authorization header for non-browser callers.
fn authenticate_handshake(
    ctx: &AppContext,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<Principal, GatewayError> {
    let token = query_param(uri.query().unwrap_or(""), "token").or_else(|| {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .map(|t| t.to_string())
    });

    let token = token.ok_or_else(|| {
        GatewayError::Unauthenticated("Missing or invalid authorization header".to_string())
    })?;

    ctx.verifier.verify(&token)
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            Some(value.to_string())
        } else {
            None
        }
    })
}

/// Builds the backend socket URL: same path, http(s) swapped for ws(s), and
/// the credential stripped from the forwarded query.
fn backend_ws_url(base_url: &str, uri: &Uri) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    };

    let forwarded_query: String = uri
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with("token="))
        .collect::<Vec<_>>()
        .join("&");

    if forwarded_query.is_empty() {
        format!("{ws_base}{}", uri.path())
    } else {
        format!("{ws_base}{}?{forwarded_query}", uri.path())
    }
}

/// Bidirectional per-frame relay. No buffering beyond the in-flight frame;
/// per-session order is preserved on each direction. A close or error on one
/// side closes the other with a matching code.
async fn relay_frames(client: WebSocket, upstream: UpstreamSocket) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    loop {
        tokio::select! {
            inbound = client_rx.next() => match inbound {
                Some(Ok(msg)) => {
                    let closing = matches!(msg, ClientMessage::Close(_));
                    if upstream_tx.send(client_to_upstream(msg)).await.is_err() {
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Client socket error, closing backend");
                    let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
                    break;
                }
                None => {
                    let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
                    break;
                }
            },
            outbound = upstream_rx.next() => match outbound {
                Some(Ok(msg)) => {
                    let Some(converted) = upstream_to_client(msg) else {
                        continue;
                    };
                    let closing = matches!(converted, ClientMessage::Close(_));
                    if client_tx.send(converted).await.is_err() {
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Backend socket error, closing client");
                    let _ = client_tx
                        .send(ClientMessage::Close(Some(CloseFrame {
                            code: 1011,
                            reason: "backend error".into(),
                        })))
                        .await;
                    break;
                }
                None => {
                    let _ = client_tx.send(ClientMessage::Close(None)).await;
                    break;
                }
            },
        }
    }
}

fn client_to_upstream(msg: ClientMessage) -> UpstreamMessage {
    match msg {
        ClientMessage::Text(text) => UpstreamMessage::Text(text),
        ClientMessage::Binary(data) => UpstreamMessage::Binary(data),
        ClientMessage::Ping(data) => UpstreamMessage::Ping(data),
        ClientMessage::Pong(data) => UpstreamMessage::Pong(data),
        ClientMessage::Close(frame) => UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        })),
    }
}

fn upstream_to_client(msg: UpstreamMessage) -> Option<ClientMessage> {
    match msg {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text)),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        UpstreamMessage::Ping(data) => Some(ClientMessage::Ping(data)),
        UpstreamMessage::Pong(data) => Some(ClientMessage::Pong(data)),
        UpstreamMessage::Close(frame) => Some(ClientMessage::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason,
        }))),
        // Raw frames never cross the relay; tungstenite only yields them when
        // explicitly configured to.
        UpstreamMessage::Frame(_) => None,
    }
}

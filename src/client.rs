// ============================================================================
// Gateway Client - Token Refresh Coordinator
// ============================================================================
//
// Typed client for callers of the gateway's public interface. Its correctness
// is coupled to the gateway's token contract: on a 401 from a non-public
// endpoint the first observer starts one refresh call and publishes a shared
// handle; concurrent observers await that same handle instead of starting
// their own. Every waiter then retries its original request exactly once.
// A 401 on the retry is terminal, never re-queued.
//
// ============================================================================

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::auth::is_public_route;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The shared refresh failed; the session was cleared and the caller
    /// must re-authenticate.
    #[error("session expired: {0}")]
    SessionExpired(String),
}

/// Cloneable failure so every waiter on the shared refresh future observes
/// the same outcome.
#[derive(Debug, Clone)]
struct RefreshFailure(String);

type RefreshFuture = Shared<BoxFuture<'static, Result<String, RefreshFailure>>>;

#[derive(Debug, Clone, Default)]
struct Session {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenData {
    access_token: String,
    refresh_token: Option<String>,
}

/// Client for the gateway's public interface.
///
/// Clones share one session and one single-flight refresh slot, so any number
/// of concurrent callers ride the same refresh.
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    session: Arc<RwLock<Session>>,
    inflight_refresh: Arc<Mutex<Option<RefreshFuture>>>,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            session: Arc::new(RwLock::new(Session::default())),
            inflight_refresh: Arc::new(Mutex::new(None)),
        }
    }

    /// Seed tokens directly (restored sessions, tests).
    pub async fn set_tokens(&self, access_token: impl Into<String>, refresh_token: impl Into<String>) {
        let mut session = self.session.write().await;
        session.access_token = Some(access_token.into());
        session.refresh_token = Some(refresh_token.into());
    }

    pub async fn access_token(&self) -> Option<String> {
        self.session.read().await.access_token.clone()
    }

    pub async fn is_logged_in(&self) -> bool {
        self.session.read().await.access_token.is_some()
    }

    /// Authenticate against the credential store behind the gateway.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/api/auth/login", self.base_url))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::SessionExpired(format!(
                "login rejected with status {}",
                response.status()
            )));
        }

        let envelope: Envelope<TokenData> = response.json().await?;
        let data = envelope
            .data
            .filter(|_| envelope.success)
            .ok_or_else(|| ClientError::SessionExpired("login response missing tokens".into()))?;

        let mut session = self.session.write().await;
        session.access_token = Some(data.access_token);
        session.refresh_token = data.refresh_token;
        Ok(())
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        let _ = self
            .http
            .post(format!("{}/api/auth/logout", self.base_url))
            .send()
            .await;
        *self.session.write().await = Session::default();
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<reqwest::Response, ClientError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ClientError> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<reqwest::Response, ClientError> {
        self.request(Method::DELETE, path, None).await
    }

    /// Send a request, transparently riding the refresh protocol on 401.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ClientError> {
        let response = self.send_once(&method, path, body.as_ref()).await?;

        // Public endpoints never trigger the refresh protocol, even on 401;
        // looping on the refresh endpoint itself would never terminate.
        if response.status() != StatusCode::UNAUTHORIZED || is_public_route(path) {
            return Ok(response);
        }

        self.join_refresh().await?;

        // Retried at most once; a 401 here is terminal and goes back to the
        // caller as-is.
        let retried = self.send_once(&method, path, body.as_ref()).await?;
        Ok(retried)
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, ClientError> {
        let mut request = self
            .http
            .request(method.clone(), format!("{}{}", self.base_url, path));
        if let Some(token) = self.session.read().await.access_token.clone() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Join (or start) the single-flight refresh and wait for its outcome.
    async fn join_refresh(&self) -> Result<String, ClientError> {
        let handle = {
            let mut slot = self.inflight_refresh.lock().await;
            match slot.as_ref() {
                Some(handle) => handle.clone(),
                None => {
                    let handle = Self::run_refresh(
                        self.http.clone(),
                        self.base_url.clone(),
                        self.session.clone(),
                        self.inflight_refresh.clone(),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(handle.clone());
                    handle
                }
            }
        };

        handle
            .await
            .map_err(|failure| ClientError::SessionExpired(failure.0))
    }

    async fn run_refresh(
        http: reqwest::Client,
        base_url: String,
        session: Arc<RwLock<Session>>,
        slot: Arc<Mutex<Option<RefreshFuture>>>,
    ) -> Result<String, RefreshFailure> {
        let outcome = Self::refresh_once(&http, &base_url, &session).await;

        // Reset the slot so the next 401 wave starts a fresh refresh.
        *slot.lock().await = None;

        match outcome {
            Ok(token) => Ok(token),
            Err(reason) => {
                // The shared refresh failed: the session is over for every
                // waiter, who must send the caller back to authentication.
                *session.write().await = Session::default();
                Err(RefreshFailure(reason))
            }
        }
    }

    async fn refresh_once(
        http: &reqwest::Client,
        base_url: &str,
        session: &Arc<RwLock<Session>>,
    ) -> Result<String, String> {
        let (access_token, refresh_token) = {
            let guard = session.read().await;
            (guard.access_token.clone(), guard.refresh_token.clone())
        };

        let mut request = http.post(format!("{base_url}/api/auth/refresh"));
        // The (possibly expired) access token still identifies the account
        // for the gateway's refresh limiter.
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }
        if let Some(refresh_token) = refresh_token {
            request = request.json(&serde_json::json!({ "refreshToken": refresh_token }));
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("refresh rejected with status {}", response.status()));
        }

        let envelope: Envelope<TokenData> = response.json().await.map_err(|e| e.to_string())?;
        let data = envelope
            .data
            .filter(|_| envelope.success)
            .ok_or_else(|| "refresh response missing token data".to_string())?;

        let mut guard = session.write().await;
        guard.access_token = Some(data.access_token.clone());
        if let Some(refresh_token) = data.refresh_token {
            guard.refresh_token = Some(refresh_token);
        }
        Ok(data.access_token)
    }
}

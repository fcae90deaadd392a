// ============================================================================
// Audit Logging - Security-Critical Operations
// ============================================================================
//
// Structured audit entries for the trust boundary:
// - Mutating calls about to be relayed to a backend (intent)
// - Authentication failures
// - Rate limit violations
//
// Audit logs are:
// - Fire-and-forget (a sink, never a gate; they cannot fail a request)
// - Structured (JSON for SIEM integration)
// - Privacy-preserving (hashed identifiers)
//
// ============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::utils::log_safe_id;

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    /// Mutating request authorized and about to be relayed to a backend
    MutatingRequest,
    /// Bearer token missing, malformed, or failed verification
    AuthenticationFailure,
    /// A rate limit layer rejected the request
    RateLimitViolation,
}

/// One audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event timestamp (ISO8601)
    pub timestamp: String,

    #[serde(rename = "event_type")]
    pub event_type: AuditEventType,

    /// Caller id (hashed for privacy)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    pub client_ip: String,

    pub method: String,

    pub path: String,

    /// Which backend the request targets (docker-control / tunnel-control)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,

    /// Additional context (limiter name, failure reason)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuditEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Audit sink for the gateway pipeline.
pub struct AuditLogger {
    hash_salt: String,
}

impl AuditLogger {
    pub fn new(hash_salt: impl Into<String>) -> Self {
        Self {
            hash_salt: hash_salt.into(),
        }
    }

    /// Records the intent to relay a mutating call, before the proxy runs.
    pub fn record_intent(
        &self,
        principal: Option<&Principal>,
        client_ip: &str,
        method: &str,
        path: &str,
        engine: &str,
    ) {
        let event = AuditEvent {
            timestamp: Utc::now().to_rfc3339(),
            event_type: AuditEventType::MutatingRequest,
            actor_hash: principal.map(|p| log_safe_id(&p.id, &self.hash_salt)),
            role: principal.map(|p| p.role.as_str().to_string()),
            client_ip: client_ip.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            engine: Some(engine.to_string()),
            details: None,
        };
        Self::emit(&event);
    }

    pub fn record_authentication_failure(
        &self,
        client_ip: &str,
        method: &str,
        path: &str,
        reason: &str,
    ) {
        let event = AuditEvent {
            timestamp: Utc::now().to_rfc3339(),
            event_type: AuditEventType::AuthenticationFailure,
            actor_hash: None,
            role: None,
            client_ip: client_ip.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            engine: None,
            details: Some(reason.to_string()),
        };
        Self::emit(&event);
    }

    pub fn record_rate_limit_violation(
        &self,
        principal: Option<&Principal>,
        client_ip: &str,
        method: &str,
        path: &str,
        limiter: &str,
        count: u32,
        limit: u32,
    ) {
        let event = AuditEvent {
            timestamp: Utc::now().to_rfc3339(),
            event_type: AuditEventType::RateLimitViolation,
            actor_hash: principal.map(|p| log_safe_id(&p.id, &self.hash_salt)),
            role: principal.map(|p| p.role.as_str().to_string()),
            client_ip: client_ip.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            engine: None,
            details: Some(format!(
                "Rate limit exceeded: {limiter} (count={count}, limit={limit})"
            )),
        };
        Self::emit(&event);
    }

    /// Emits through tracing at INFO on the dedicated "audit" target so log
    /// aggregation can index audit events separately from diagnostics.
    fn emit(event: &AuditEvent) {
        let json = event.to_json();
        tracing::info!(
            target: "audit",
            event_type = ?event.event_type,
            actor_hash = event.actor_hash.as_deref(),
            client_ip = %event.client_ip,
            method = %event.method,
            path = %event.path,
            json = %json,
            "AUDIT: Security event logged"
        );
    }
}

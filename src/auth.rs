use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::GatewayError;
use crate::rbac::Role;

/// Routes that bypass token verification entirely. No Principal is attached;
/// the request continues with anonymous standing (and anonymous rate limits).
pub const PUBLIC_ROUTES: &[&str] = &[
    "/api/auth/setup",
    "/api/auth/login",
    "/api/auth/setup-status",
    "/api/auth/refresh",
    "/api/auth/logout",
    "/api/health",
];

pub fn is_public_route(path: &str) -> bool {
    PUBLIC_ROUTES.contains(&path)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub username: String,
    pub role: Role,
    pub exp: i64, // expiration time
    pub iat: i64, // issued at
    pub iss: String,
}

/// Authenticated identity attached to a request after token verification.
/// Derived fresh per request; the gateway never persists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub username: String,
    pub role: Role,
}

/// Verifies access tokens minted by the credential store.
///
/// The gateway only ever verifies: RS256 against a public key when
/// `JWT_PUBLIC_KEY` is configured, otherwise HS256 against the shared secret.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    issuer: String,
}

impl TokenVerifier {
    pub fn new(config: &Config) -> Result<Self> {
        let (decoding_key, algorithm) = if let Some(public_key) = &config.jwt_public_key {
            tracing::info!("Token verification using RS256 (verify-only, public key)");
            let key = DecodingKey::from_rsa_pem(public_key.as_bytes())
                .context("Failed to parse JWT_PUBLIC_KEY as RSA PEM")?;
            (key, Algorithm::RS256)
        } else {
            tracing::info!("Token verification using HS256 (shared secret)");
            (
                DecodingKey::from_secret(config.jwt_secret.as_bytes()),
                Algorithm::HS256,
            )
        };

        Ok(Self {
            decoding_key,
            algorithm,
            issuer: config.jwt_issuer.clone(),
        })
    }

    /// Verify and decode a bearer token into a Principal.
    ///
    /// Any failure (bad signature, expired, malformed, wrong issuer) collapses
    /// into the same terminal UNAUTHENTICATED error; callers never learn which.
    pub fn verify(&self, token: &str) -> Result<Principal, GatewayError> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[self.issuer.clone()]);

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token verification failed");
                GatewayError::Unauthenticated("Invalid or expired token".to_string())
            })?;

        Ok(Principal {
            id: data.claims.sub,
            username: data.claims.username,
            role: data.claims.role,
        })
    }
}

/// Pulls the bearer token out of an Authorization header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value.strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn test_config(secret: &str) -> Config {
        Config {
            port: 0,
            docker_engine_url: String::new(),
            tunnel_engine_url: String::new(),
            jwt_secret: secret.to_string(),
            jwt_public_key: None,
            jwt_issuer: "quayside".to_string(),
            rust_log: "info".to_string(),
            log_hash_salt: "salt".to_string(),
            proxy_timeout_secs: 5,
            unmapped_route_policy: crate::config::UnmappedRoutePolicy::Allow,
            sweep_interval_secs: 60,
            rate_limits: Default::default(),
        }
    }

    fn mint(secret: &str, issuer: &str, exp_offset_secs: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "u-1".to_string(),
            username: "alice".to_string(),
            role: Role::Operator,
            exp: now + exp_offset_secs,
            iat: now,
            iss: issuer.to_string(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verifies_valid_token() {
        let verifier = TokenVerifier::new(&test_config("s3cret")).unwrap();
        let principal = verifier.verify(&mint("s3cret", "quayside", 3600)).unwrap();
        assert_eq!(principal.id, "u-1");
        assert_eq!(principal.username, "alice");
        assert_eq!(principal.role, Role::Operator);
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = TokenVerifier::new(&test_config("s3cret")).unwrap();
        let err = verifier
            .verify(&mint("s3cret", "quayside", -3600))
            .unwrap_err();
        assert_eq!(err.error_code(), "UNAUTHENTICATED");
    }

    #[test]
    fn rejects_wrong_signature_and_wrong_issuer() {
        let verifier = TokenVerifier::new(&test_config("s3cret")).unwrap();
        assert!(verifier.verify(&mint("other", "quayside", 3600)).is_err());
        assert!(verifier.verify(&mint("s3cret", "intruder", 3600)).is_err());
        assert!(verifier.verify("garbage").is_err());
    }

    #[test]
    fn public_allow_list_is_exact_match() {
        assert!(is_public_route("/api/auth/login"));
        assert!(is_public_route("/api/health"));
        assert!(!is_public_route("/api/auth/login/extra"));
        assert!(!is_public_route("/api/containers"));
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
    }
}

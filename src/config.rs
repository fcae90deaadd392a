use anyhow::Result;

// ============================================================================
// Configuration Constants
// ============================================================================

// Default listen port
const DEFAULT_PORT: u16 = 8080;

// Default backend base URLs
const DEFAULT_DOCKER_ENGINE_URL: &str = "http://127.0.0.1:9001";
const DEFAULT_TUNNEL_ENGINE_URL: &str = "http://127.0.0.1:9002";

// Default upstream timeout (time to response headers; bodies stream freely)
const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 30;

// Rate limit defaults, per policy (window seconds, max requests)
const DEFAULT_ANON_WINDOW_SECS: u64 = 60;
const DEFAULT_ANON_MAX: u32 = 60;
const DEFAULT_AUTHED_WINDOW_SECS: u64 = 60;
const DEFAULT_ADMIN_MAX: u32 = 1000;
const DEFAULT_OPERATOR_MAX: u32 = 500;
const DEFAULT_VIEWER_MAX: u32 = 200;
const DEFAULT_LOGIN_WINDOW_SECS: u64 = 15 * 60;
const DEFAULT_LOGIN_MAX: u32 = 5;
const DEFAULT_SETUP_WINDOW_SECS: u64 = 10 * 60;
const DEFAULT_SETUP_MAX: u32 = 10;
const DEFAULT_REFRESH_WINDOW_SECS: u64 = 5 * 60;
const DEFAULT_REFRESH_MAX: u32 = 30;
const DEFAULT_HEAVY_WINDOW_SECS: u64 = 60;
const DEFAULT_HEAVY_MAX: u32 = 10;

// Ledger sweep cadence
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

// Buffered-body cap for the login limiter's username peek
pub const MAX_BUFFERED_AUTH_BODY: usize = 64 * 1024; // 64 KB

// ============================================================================
// Configuration Structures
// ============================================================================

/// What to do with a request whose route has no entry in the permission map.
///
/// `Allow` replicates the historically observed fail-open behavior; `Deny`
/// rejects with 403. The policy is explicit and tested either way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnmappedRoutePolicy {
    Allow,
    Deny,
}

/// Window/max pairs for every rate-limit policy layer.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub anon_window_secs: u64,
    pub anon_max: u32,
    pub authed_window_secs: u64,
    pub admin_max: u32,
    pub operator_max: u32,
    pub viewer_max: u32,
    pub login_window_secs: u64,
    pub login_max: u32,
    pub setup_window_secs: u64,
    pub setup_max: u32,
    pub refresh_window_secs: u64,
    pub refresh_max: u32,
    pub heavy_window_secs: u64,
    pub heavy_max: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            anon_window_secs: DEFAULT_ANON_WINDOW_SECS,
            anon_max: DEFAULT_ANON_MAX,
            authed_window_secs: DEFAULT_AUTHED_WINDOW_SECS,
            admin_max: DEFAULT_ADMIN_MAX,
            operator_max: DEFAULT_OPERATOR_MAX,
            viewer_max: DEFAULT_VIEWER_MAX,
            login_window_secs: DEFAULT_LOGIN_WINDOW_SECS,
            login_max: DEFAULT_LOGIN_MAX,
            setup_window_secs: DEFAULT_SETUP_WINDOW_SECS,
            setup_max: DEFAULT_SETUP_MAX,
            refresh_window_secs: DEFAULT_REFRESH_WINDOW_SECS,
            refresh_max: DEFAULT_REFRESH_MAX,
            heavy_window_secs: DEFAULT_HEAVY_WINDOW_SECS,
            heavy_max: DEFAULT_HEAVY_MAX,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub docker_engine_url: String,
    pub tunnel_engine_url: String,
    /// HS256 shared secret. Ignored when `jwt_public_key` is set.
    pub jwt_secret: String,
    /// RS256 public key (PEM). When set the gateway verifies RS256 only.
    pub jwt_public_key: Option<String>,
    pub jwt_issuer: String,
    pub rust_log: String,
    pub log_hash_salt: String,
    pub proxy_timeout_secs: u64,
    pub unmapped_route_policy: UnmappedRoutePolicy,
    pub sweep_interval_secs: u64,
    pub rate_limits: RateLimitConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let jwt_public_key = std::env::var("JWT_PUBLIC_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_default();
        if jwt_public_key.is_none() && jwt_secret.trim().is_empty() {
            anyhow::bail!(
                "No JWT verification material configured. Set either:\n\
                - JWT_PUBLIC_KEY (RS256 verify-only)\n\
                - JWT_SECRET (HS256)"
            );
        }

        let unmapped_route_policy = match std::env::var("RBAC_UNMAPPED_ROUTE_POLICY")
            .unwrap_or_else(|_| "allow".to_string())
            .to_lowercase()
            .as_str()
        {
            "deny" => UnmappedRoutePolicy::Deny,
            _ => UnmappedRoutePolicy::Allow,
        };

        Ok(Self {
            port: env_parse("GATEWAY_PORT", DEFAULT_PORT),
            docker_engine_url: env_or("DOCKER_ENGINE_URL", DEFAULT_DOCKER_ENGINE_URL),
            tunnel_engine_url: env_or("TUNNEL_ENGINE_URL", DEFAULT_TUNNEL_ENGINE_URL),
            jwt_secret,
            jwt_public_key,
            jwt_issuer: env_or("JWT_ISSUER", "quayside"),
            rust_log: env_or("RUST_LOG", "info"),
            log_hash_salt: env_or("LOG_HASH_SALT", "quayside-audit"),
            proxy_timeout_secs: env_parse("PROXY_TIMEOUT_SECS", DEFAULT_PROXY_TIMEOUT_SECS),
            unmapped_route_policy,
            sweep_interval_secs: env_parse(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS",
                DEFAULT_SWEEP_INTERVAL_SECS,
            ),
            rate_limits: RateLimitConfig {
                anon_window_secs: env_parse("RATE_LIMIT_ANON_WINDOW_SECS", DEFAULT_ANON_WINDOW_SECS),
                anon_max: env_parse("RATE_LIMIT_ANON_MAX", DEFAULT_ANON_MAX),
                authed_window_secs: env_parse(
                    "RATE_LIMIT_AUTHED_WINDOW_SECS",
                    DEFAULT_AUTHED_WINDOW_SECS,
                ),
                admin_max: env_parse("RATE_LIMIT_ADMIN_MAX", DEFAULT_ADMIN_MAX),
                operator_max: env_parse("RATE_LIMIT_OPERATOR_MAX", DEFAULT_OPERATOR_MAX),
                viewer_max: env_parse("RATE_LIMIT_VIEWER_MAX", DEFAULT_VIEWER_MAX),
                login_window_secs: env_parse(
                    "RATE_LIMIT_LOGIN_WINDOW_SECS",
                    DEFAULT_LOGIN_WINDOW_SECS,
                ),
                login_max: env_parse("RATE_LIMIT_LOGIN_MAX", DEFAULT_LOGIN_MAX),
                setup_window_secs: env_parse(
                    "RATE_LIMIT_SETUP_WINDOW_SECS",
                    DEFAULT_SETUP_WINDOW_SECS,
                ),
                setup_max: env_parse("RATE_LIMIT_SETUP_MAX", DEFAULT_SETUP_MAX),
                refresh_window_secs: env_parse(
                    "RATE_LIMIT_REFRESH_WINDOW_SECS",
                    DEFAULT_REFRESH_WINDOW_SECS,
                ),
                refresh_max: env_parse("RATE_LIMIT_REFRESH_MAX", DEFAULT_REFRESH_MAX),
                heavy_window_secs: env_parse(
                    "RATE_LIMIT_HEAVY_WINDOW_SECS",
                    DEFAULT_HEAVY_WINDOW_SECS,
                ),
                heavy_max: env_parse("RATE_LIMIT_HEAVY_MAX", DEFAULT_HEAVY_MAX),
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

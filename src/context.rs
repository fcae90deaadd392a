use std::sync::Arc;

use anyhow::Result;

use crate::audit::AuditLogger;
use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::proxy::ProxyClient;
use crate::ratelimit::{PolicySet, RateLimitLedger};
use crate::rbac::RoutePermissionMap;

/// Shared application state threaded through the router.
///
/// Built once at startup; everything in here is either immutable or
/// internally synchronized (the ledger).
pub struct AppContext {
    pub config: Config,
    pub verifier: TokenVerifier,
    pub routes: RoutePermissionMap,
    pub ledger: Arc<RateLimitLedger>,
    pub policies: PolicySet,
    pub proxy: ProxyClient,
    pub audit: AuditLogger,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self> {
        let verifier = TokenVerifier::new(&config)?;
        let policies = PolicySet::from_config(&config.rate_limits);
        let proxy = ProxyClient::new(config.proxy_timeout_secs);
        let audit = AuditLogger::new(config.log_hash_salt.clone());

        Ok(Self {
            verifier,
            routes: RoutePermissionMap::with_default_rules(),
            ledger: Arc::new(RateLimitLedger::new()),
            policies,
            proxy,
            audit,
            config,
        })
    }
}

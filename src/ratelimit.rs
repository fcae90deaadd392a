// ============================================================================
// Rate Limit Ledger & Policies
// ============================================================================
//
// In-memory keyed counters with time-window expiry, shared by every limiter
// layer. Process-local by design: a single gateway instance owns its ledger;
// horizontal scaling requires an external atomically-incrementable store and
// is out of scope here.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::RateLimitConfig;
use crate::rbac::Role;

/// One counter window: monotonic within the window, reset exactly once at the
/// boundary, never retroactively.
#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u32,
    reset_at_ms: u64,
}

/// Result of an increment, used to build headers and verdicts.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub count: u32,
    pub reset_at_ms: u64,
}

impl Snapshot {
    /// Seconds until the window resets, rounded up, at least 1.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        let remaining_ms = self.reset_at_ms.saturating_sub(now_ms);
        remaining_ms.div_ceil(1000).max(1)
    }
}

/// In-memory counter store backing all rate-limit policies.
pub struct RateLimitLedger {
    entries: Mutex<HashMap<String, Entry>>,
}

impl RateLimitLedger {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Shared primitive: create `{count:1, reset:now+window}` if the key is
    /// absent or its window elapsed, else increment in place. The whole
    /// read-modify-write happens under the map lock, so it is atomic per key
    /// even on a multi-threaded runtime.
    pub fn increment(&self, key: &str, window: Duration) -> Snapshot {
        let now = Self::now_ms();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if now > e.reset_at_ms {
                    e.count = 1;
                    e.reset_at_ms = now + window.as_millis() as u64;
                } else {
                    e.count += 1;
                }
            })
            .or_insert(Entry {
                count: 1,
                reset_at_ms: now + window.as_millis() as u64,
            });

        Snapshot {
            count: entry.count,
            reset_at_ms: entry.reset_at_ms,
        }
    }

    /// Deletes every entry past its reset time. Called by the background
    /// sweep so memory stays bounded to active keys, independent of traffic.
    pub fn sweep(&self) -> usize {
        let now = Self::now_ms();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| now <= e.reset_at_ms);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RateLimitLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// {windowMs, maxRequests} for one caller class / endpoint class.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub window: Duration,
    pub max_requests: u32,
}

impl Policy {
    pub fn new(window_secs: u64, max_requests: u32) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            max_requests,
        }
    }
}

/// The five policy layers of the gateway, resolved once from configuration.
#[derive(Debug, Clone, Copy)]
pub struct PolicySet {
    pub anonymous: Policy,
    pub admin: Policy,
    pub operator: Policy,
    pub viewer: Policy,
    pub login: Policy,
    pub setup: Policy,
    pub refresh: Policy,
    pub heavy: Policy,
}

impl PolicySet {
    pub fn from_config(limits: &RateLimitConfig) -> Self {
        Self {
            anonymous: Policy::new(limits.anon_window_secs, limits.anon_max),
            admin: Policy::new(limits.authed_window_secs, limits.admin_max),
            operator: Policy::new(limits.authed_window_secs, limits.operator_max),
            viewer: Policy::new(limits.authed_window_secs, limits.viewer_max),
            login: Policy::new(limits.login_window_secs, limits.login_max),
            setup: Policy::new(limits.setup_window_secs, limits.setup_max),
            refresh: Policy::new(limits.refresh_window_secs, limits.refresh_max),
            heavy: Policy::new(limits.heavy_window_secs, limits.heavy_max),
        }
    }

    /// Role-tiered general policy for authenticated callers.
    pub fn for_role(&self, role: Role) -> Policy {
        match role {
            Role::Admin => self.admin,
            Role::Operator => self.operator,
            Role::Viewer => self.viewer,
        }
    }
}

/// Spawns the periodic sweep reclaiming expired ledger entries.
pub fn spawn_sweeper(
    ledger: std::sync::Arc<RateLimitLedger>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; skip it so the sweep runs on cadence.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = ledger.sweep();
            if removed > 0 {
                tracing::debug!(removed, remaining = ledger.len(), "Swept rate limit ledger");
            }
        }
    })
}

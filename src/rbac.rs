// ============================================================================
// RBAC Authorizer
// ============================================================================
//
// Maps verb + path templates to required permissions and checks them against
// the caller's role. Resolution order:
// - exact VERB:path match first
// - then template scan (`:param` segments match one path segment), with the
//   table sorted most-specific-first at construction so precedence does not
//   depend on insertion order
// Unmapped routes follow the configured policy (allow by default).
//
// ============================================================================

use axum::http::Method;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::UnmappedRoutePolicy;

/// Caller role carried in the token's `role` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
        }
    }

    /// Static permission set for this role. Immutable at runtime.
    pub fn permissions(&self) -> &'static [&'static str] {
        match self {
            Role::Admin => ADMIN_PERMISSIONS,
            Role::Operator => OPERATOR_PERMISSIONS,
            Role::Viewer => VIEWER_PERMISSIONS,
        }
    }

    /// Checks `resource:verb` against this role: exact match, role-level `*`,
    /// or resource-level `resource:*`.
    pub fn has_permission(&self, permission: &str) -> bool {
        let granted = self.permissions();
        if granted.contains(&"*") || granted.contains(&permission) {
            return true;
        }
        match permission.split_once(':') {
            Some((resource, _)) => {
                let wildcard = format!("{resource}:*");
                granted.iter().any(|g| *g == wildcard)
            }
            None => false,
        }
    }
}

// Admin holds the wildcard for every resource.
static ADMIN_PERMISSIONS: &[&str] = &[
    "containers:*",
    "images:*",
    "volumes:*",
    "networks:*",
    "builds:*",
    "compose:*",
    "tunnels:*",
    "system:*",
    "users:*",
    "settings:*",
    "repositories:*",
    "webhooks:*",
];

// Operator: read/operate across workload resources, no user management and
// read-only settings.
static OPERATOR_PERMISSIONS: &[&str] = &[
    "containers:list",
    "containers:read",
    "containers:logs",
    "containers:stats",
    "containers:create",
    "containers:start",
    "containers:stop",
    "containers:restart",
    "containers:remove",
    "containers:exec",
    "images:list",
    "images:read",
    "images:pull",
    "images:remove",
    "volumes:list",
    "volumes:read",
    "volumes:create",
    "volumes:remove",
    "networks:list",
    "networks:read",
    "networks:create",
    "networks:remove",
    "builds:list",
    "builds:read",
    "builds:create",
    "compose:list",
    "compose:read",
    "compose:create",
    "compose:up",
    "compose:down",
    "compose:remove",
    "tunnels:list",
    "tunnels:read",
    "tunnels:logs",
    "tunnels:create",
    "tunnels:start",
    "tunnels:stop",
    "tunnels:remove",
    "system:*",
    "settings:read",
    "repositories:list",
    "repositories:read",
    "webhooks:list",
    "webhooks:read",
];

// Viewer: read/list/logs/stats only, no mutating verbs anywhere.
static VIEWER_PERMISSIONS: &[&str] = &[
    "containers:list",
    "containers:read",
    "containers:logs",
    "containers:stats",
    "images:list",
    "images:read",
    "volumes:list",
    "volumes:read",
    "networks:list",
    "networks:read",
    "builds:list",
    "builds:read",
    "compose:list",
    "compose:read",
    "tunnels:list",
    "tunnels:read",
    "tunnels:logs",
    "system:*",
    "repositories:list",
    "repositories:read",
    "webhooks:list",
    "webhooks:read",
];

/// One entry of the route permission map.
struct RouteRule {
    method: Method,
    template: &'static str,
    permission: &'static str,
    pattern: Regex,
    static_segments: usize,
    wildcard_segments: usize,
    order: usize,
}

/// Ordered (verb, path template) -> permission table.
///
/// Sorted most-specific-first: more static segments win, then fewer wildcard
/// segments, then original insertion order as the final tiebreak. This makes
/// "first match wins" a deterministic contract instead of an insertion-order
/// accident.
pub struct RoutePermissionMap {
    rules: Vec<RouteRule>,
}

impl RoutePermissionMap {
    pub fn with_default_rules() -> Self {
        Self::from_rules(default_rules())
    }

    pub fn from_rules(rules: Vec<(Method, &'static str, &'static str)>) -> Self {
        let mut compiled: Vec<RouteRule> = rules
            .into_iter()
            .enumerate()
            .map(|(order, (method, template, permission))| {
                let (pattern, static_segments, wildcard_segments) = compile_template(template);
                RouteRule {
                    method,
                    template,
                    permission,
                    pattern,
                    static_segments,
                    wildcard_segments,
                    order,
                }
            })
            .collect();

        compiled.sort_by(|a, b| {
            b.static_segments
                .cmp(&a.static_segments)
                .then(a.wildcard_segments.cmp(&b.wildcard_segments))
                .then(a.order.cmp(&b.order))
        });

        Self { rules: compiled }
    }

    /// Resolve the permission required for a request, or None if the route is
    /// not in the table.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<&'static str> {
        // Exact match first: templates without parameters compare literally.
        for rule in &self.rules {
            if rule.wildcard_segments == 0 && &rule.method == method && rule.template == path {
                return Some(rule.permission);
            }
        }

        // Template scan in most-specific-first order.
        for rule in &self.rules {
            if rule.wildcard_segments > 0 && &rule.method == method && rule.pattern.is_match(path) {
                return Some(rule.permission);
            }
        }

        None
    }

    /// Authorization verdict for a resolved (or unresolved) route.
    pub fn authorize(
        &self,
        role: Role,
        method: &Method,
        path: &str,
        unmapped_policy: UnmappedRoutePolicy,
    ) -> bool {
        match self.resolve(method, path) {
            Some(permission) => role.has_permission(permission),
            None => unmapped_policy == UnmappedRoutePolicy::Allow,
        }
    }
}

/// Compiles a `:param` template into an anchored regex and counts segment
/// kinds for the specificity sort.
fn compile_template(template: &str) -> (Regex, usize, usize) {
    let mut static_segments = 0;
    let mut wildcard_segments = 0;
    let pattern: String = template
        .split('/')
        .map(|segment| {
            if segment.starts_with(':') {
                wildcard_segments += 1;
                "[^/]+".to_string()
            } else {
                if !segment.is_empty() {
                    static_segments += 1;
                }
                regex::escape(segment)
            }
        })
        .collect::<Vec<_>>()
        .join("/");

    let regex = Regex::new(&format!("^{pattern}$"))
        .unwrap_or_else(|e| panic!("invalid route template {template:?}: {e}"));
    (regex, static_segments, wildcard_segments)
}

/// The platform's route permission table.
fn default_rules() -> Vec<(Method, &'static str, &'static str)> {
    vec![
        // Containers
        (Method::GET, "/api/containers", "containers:list"),
        (Method::POST, "/api/containers", "containers:create"),
        (Method::GET, "/api/containers/:id", "containers:read"),
        (Method::GET, "/api/containers/:id/logs", "containers:logs"),
        (Method::GET, "/api/containers/:id/stats", "containers:stats"),
        (Method::POST, "/api/containers/:id/start", "containers:start"),
        (Method::POST, "/api/containers/:id/stop", "containers:stop"),
        (
            Method::POST,
            "/api/containers/:id/restart",
            "containers:restart",
        ),
        (Method::POST, "/api/containers/:id/exec", "containers:exec"),
        (Method::DELETE, "/api/containers/:id", "containers:remove"),
        // Images
        (Method::GET, "/api/images", "images:list"),
        (Method::GET, "/api/images/:id", "images:read"),
        (Method::POST, "/api/images/pull", "images:pull"),
        (Method::DELETE, "/api/images/:id", "images:remove"),
        // Volumes
        (Method::GET, "/api/volumes", "volumes:list"),
        (Method::POST, "/api/volumes", "volumes:create"),
        (Method::GET, "/api/volumes/:name", "volumes:read"),
        (Method::DELETE, "/api/volumes/:name", "volumes:remove"),
        // Networks
        (Method::GET, "/api/networks", "networks:list"),
        (Method::POST, "/api/networks", "networks:create"),
        (Method::GET, "/api/networks/:id", "networks:read"),
        (Method::DELETE, "/api/networks/:id", "networks:remove"),
        // Builds
        (Method::GET, "/api/builds", "builds:list"),
        (Method::POST, "/api/builds", "builds:create"),
        (Method::GET, "/api/builds/:id", "builds:read"),
        // Compose stacks
        (Method::GET, "/api/compose", "compose:list"),
        (Method::POST, "/api/compose", "compose:create"),
        (Method::GET, "/api/compose/:name", "compose:read"),
        (Method::POST, "/api/compose/:name/up", "compose:up"),
        (Method::POST, "/api/compose/:name/down", "compose:down"),
        (Method::DELETE, "/api/compose/:name", "compose:remove"),
        // Tunnels
        (Method::GET, "/api/tunnels", "tunnels:list"),
        (Method::POST, "/api/tunnels", "tunnels:create"),
        (Method::GET, "/api/tunnels/:id", "tunnels:read"),
        (Method::GET, "/api/tunnels/:id/logs", "tunnels:logs"),
        (Method::POST, "/api/tunnels/:id/start", "tunnels:start"),
        (Method::POST, "/api/tunnels/:id/stop", "tunnels:stop"),
        (Method::DELETE, "/api/tunnels/:id", "tunnels:remove"),
        // System
        (Method::GET, "/api/system/info", "system:read"),
        (Method::GET, "/api/system/df", "system:read"),
        (Method::POST, "/api/system/prune", "system:prune"),
        // Users
        (Method::GET, "/api/users", "users:list"),
        (Method::POST, "/api/users", "users:create"),
        (Method::GET, "/api/users/:id", "users:read"),
        (Method::PUT, "/api/users/:id", "users:update"),
        (Method::DELETE, "/api/users/:id", "users:remove"),
        // Settings
        (Method::GET, "/api/settings", "settings:read"),
        (Method::PUT, "/api/settings", "settings:update"),
        // Repositories & webhooks
        (Method::GET, "/api/repositories", "repositories:list"),
        (Method::POST, "/api/repositories", "repositories:create"),
        (Method::GET, "/api/repositories/:id", "repositories:read"),
        (Method::PUT, "/api/repositories/:id", "repositories:update"),
        (
            Method::DELETE,
            "/api/repositories/:id",
            "repositories:remove",
        ),
        (Method::GET, "/api/webhooks", "webhooks:list"),
        (Method::POST, "/api/webhooks", "webhooks:create"),
        (Method::DELETE, "/api/webhooks/:id", "webhooks:remove"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_can_start_containers_viewer_cannot() {
        assert!(Role::Operator.has_permission("containers:start"));
        assert!(!Role::Viewer.has_permission("containers:start"));
    }

    #[test]
    fn admin_wildcard_covers_everything() {
        assert!(Role::Admin.has_permission("containers:start"));
        assert!(Role::Admin.has_permission("users:remove"));
        assert!(Role::Admin.has_permission("settings:update"));
    }

    #[test]
    fn resource_wildcard_grants_unlisted_verbs() {
        // system:* on viewer covers any system verb
        assert!(Role::Viewer.has_permission("system:read"));
        assert!(Role::Viewer.has_permission("system:prune"));
        assert!(!Role::Viewer.has_permission("users:list"));
    }

    #[test]
    fn operator_lacks_user_management_and_settings_mutation() {
        assert!(!Role::Operator.has_permission("users:create"));
        assert!(!Role::Operator.has_permission("users:list"));
        assert!(!Role::Operator.has_permission("settings:update"));
        assert!(Role::Operator.has_permission("settings:read"));
    }

    #[test]
    fn id_template_matches_single_segment_only() {
        let map = RoutePermissionMap::with_default_rules();
        assert_eq!(
            map.resolve(&Method::GET, "/api/containers/abc123"),
            Some("containers:read")
        );
        // The longer path resolves via its own, more specific entry.
        assert_eq!(
            map.resolve(&Method::GET, "/api/containers/abc123/logs"),
            Some("containers:logs")
        );
        assert_eq!(
            map.resolve(&Method::GET, "/api/containers/abc123/logs/extra"),
            None
        );
    }

    #[test]
    fn exact_match_beats_template() {
        // /api/images/pull could be shadowed by /api/images/:id on DELETE-less
        // tables; the exact entry must win for POST.
        let map = RoutePermissionMap::with_default_rules();
        assert_eq!(
            map.resolve(&Method::POST, "/api/images/pull"),
            Some("images:pull")
        );
        assert_eq!(
            map.resolve(&Method::GET, "/api/images/pull"),
            Some("images:read")
        );
    }

    #[test]
    fn more_specific_template_wins_regardless_of_order() {
        // Deliberately insert the broad rule before the specific one.
        let map = RoutePermissionMap::from_rules(vec![
            (Method::GET, "/api/things/:id", "things:read"),
            (Method::GET, "/api/things/:id/logs", "things:logs"),
        ]);
        assert_eq!(
            map.resolve(&Method::GET, "/api/things/42/logs"),
            Some("things:logs")
        );
        assert_eq!(
            map.resolve(&Method::GET, "/api/things/42"),
            Some("things:read")
        );
    }

    #[test]
    fn verb_mismatch_does_not_resolve() {
        let map = RoutePermissionMap::with_default_rules();
        assert_eq!(map.resolve(&Method::PATCH, "/api/containers"), None);
    }

    #[test]
    fn unmapped_route_policy_allow() {
        let map = RoutePermissionMap::with_default_rules();
        assert!(map.authorize(
            Role::Viewer,
            &Method::GET,
            "/api/not-in-table",
            UnmappedRoutePolicy::Allow,
        ));
    }

    #[test]
    fn unmapped_route_policy_deny() {
        let map = RoutePermissionMap::with_default_rules();
        assert!(!map.authorize(
            Role::Admin,
            &Method::GET,
            "/api/not-in-table",
            UnmappedRoutePolicy::Deny,
        ));
    }

    #[test]
    fn authorize_checks_role_on_mapped_routes() {
        let map = RoutePermissionMap::with_default_rules();
        assert!(!map.authorize(
            Role::Viewer,
            &Method::POST,
            "/api/containers/abc/start",
            UnmappedRoutePolicy::Allow,
        ));
        assert!(map.authorize(
            Role::Operator,
            &Method::POST,
            "/api/containers/abc/start",
            UnmappedRoutePolicy::Allow,
        ));
    }
}

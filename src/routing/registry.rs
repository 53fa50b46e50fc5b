//! # Service Registry
//!
//! The routable service table. Lookups resolve a request path to the route with
//! the longest matching prefix; updates replace one route at a time.
//!
//! The table is an immutable [`RouteTable`] published through an `ArcSwap`:
//! readers load the current snapshot without locking, writers build a new table
//! and swap it in. A request that already resolved its `Arc<ServiceRoute>` keeps
//! using it even if the route is replaced while the request is in flight.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::core::error::GatewayError;
use crate::core::types::ServiceRoute;
use crate::observability::health::HealthProbe;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("no service registered for {path}")]
    NotFound { path: String },

    #[error("prefix {prefix} is claimed by both {existing} and {incoming}")]
    PrefixConflict {
        prefix: String,
        existing: String,
        incoming: String,
    },

    #[error("service {0} is defined more than once")]
    DuplicateName(String),

    #[error("route name {given} does not match service {expected}")]
    NameMismatch { expected: String, given: String },

    #[error("service {service} failed its reachability check: {reason}")]
    Unreachable { service: String, reason: String },
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidPath { .. } => GatewayError::validation("path", err.to_string()),
            RegistryError::NotFound { path } => GatewayError::not_found(path),
            RegistryError::PrefixConflict { .. } | RegistryError::DuplicateName(_) => {
                GatewayError::config(err.to_string())
            }
            RegistryError::NameMismatch { .. } => GatewayError::validation("name", err.to_string()),
            RegistryError::Unreachable { service, reason } => {
                GatewayError::service_unavailable(service, reason)
            }
        }
    }
}

/// Normalize a request path or route prefix.
///
/// Duplicate slashes collapse, `.` segments are dropped and any `..` segment
/// (including its percent-encoded spellings) is rejected. The result always
/// starts with `/` and never ends with one unless it is the root.
pub fn normalize_path(raw: &str) -> Result<String, RegistryError> {
    let invalid = |reason| RegistryError::InvalidPath {
        path: raw.to_string(),
        reason,
    };

    if !raw.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }

    let mut normalized = String::with_capacity(raw.len());
    for segment in raw.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if is_parent_segment(segment) {
            return Err(invalid("parent segments are not allowed"));
        }
        normalized.push('/');
        normalized.push_str(segment);
    }

    if normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

fn is_parent_segment(segment: &str) -> bool {
    segment.len() <= 6 && segment.to_ascii_lowercase().replace("%2e", ".") == ".."
}

/// Whether `path` falls under `prefix` on a segment boundary
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Immutable snapshot of the routing table
#[derive(Debug, Default)]
pub struct RouteTable {
    /// Sorted by prefix length, longest first
    by_prefix: Vec<Arc<ServiceRoute>>,
    by_name: HashMap<String, Arc<ServiceRoute>>,
}

impl RouteTable {
    /// Build a table, rejecting duplicate names and prefixes
    pub fn from_routes(routes: Vec<ServiceRoute>) -> Result<Self, RegistryError> {
        Self::build(routes.into_iter().map(Arc::new).collect())
    }

    fn build(routes: Vec<Arc<ServiceRoute>>) -> Result<Self, RegistryError> {
        let mut by_name = HashMap::with_capacity(routes.len());
        let mut by_prefix_owner: HashMap<&str, &str> = HashMap::with_capacity(routes.len());

        for route in &routes {
            if let Some(existing) = by_prefix_owner.insert(&route.path_prefix, &route.name) {
                return Err(RegistryError::PrefixConflict {
                    prefix: route.path_prefix.clone(),
                    existing: existing.to_string(),
                    incoming: route.name.clone(),
                });
            }
            if by_name
                .insert(route.name.clone(), Arc::clone(route))
                .is_some()
            {
                return Err(RegistryError::DuplicateName(route.name.clone()));
            }
        }

        let mut by_prefix = routes;
        by_prefix.sort_by(|a, b| {
            b.path_prefix
                .len()
                .cmp(&a.path_prefix.len())
                .then_with(|| a.path_prefix.cmp(&b.path_prefix))
        });

        Ok(Self { by_prefix, by_name })
    }

    /// Longest-prefix lookup on an already normalized path
    pub fn lookup(&self, normalized_path: &str) -> Option<Arc<ServiceRoute>> {
        self.by_prefix
            .iter()
            .find(|route| prefix_matches(&route.path_prefix, normalized_path))
            .cloned()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceRoute>> {
        self.by_name.get(name).cloned()
    }

    /// Routes sorted by name
    pub fn routes(&self) -> Vec<Arc<ServiceRoute>> {
        let mut routes: Vec<_> = self.by_name.values().cloned().collect();
        routes.sort_by(|a, b| a.name.cmp(&b.name));
        routes
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// New table with `route` inserted or replacing the route of the same name
    fn with_route(&self, route: Arc<ServiceRoute>) -> Result<Self, RegistryError> {
        let mut routes: Vec<Arc<ServiceRoute>> = self
            .by_name
            .values()
            .filter(|existing| existing.name != route.name)
            .cloned()
            .collect();
        routes.push(route);
        Self::build(routes)
    }
}

/// Change notification for components keeping per-route state
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    RouteReplaced {
        previous: Option<Arc<ServiceRoute>>,
        current: Arc<ServiceRoute>,
    },
}

pub type RegistryEventReceiver = broadcast::Receiver<RegistryEvent>;

/// Live service registry
pub struct ServiceRegistry {
    table: ArcSwap<RouteTable>,
    /// Serializes writers; readers never touch it
    write_lock: Mutex<()>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ServiceRegistry {
    pub fn new(table: RouteTable) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            table: ArcSwap::from_pointee(table),
            write_lock: Mutex::new(()),
            events,
        }
    }

    pub fn from_routes(routes: Vec<ServiceRoute>) -> Result<Self, RegistryError> {
        Ok(Self::new(RouteTable::from_routes(routes)?))
    }

    /// Resolve a raw request path to its route
    pub fn resolve(&self, raw_path: &str) -> Result<Arc<ServiceRoute>, RegistryError> {
        let path = normalize_path(raw_path)?;
        self.table
            .load()
            .lookup(&path)
            .ok_or(RegistryError::NotFound { path })
    }

    /// Current table snapshot
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceRoute>> {
        self.table.load().get(name)
    }

    pub fn routes(&self) -> Vec<Arc<ServiceRoute>> {
        self.table.load().routes()
    }

    /// Replace (or add) the route for `service_name`.
    ///
    /// With a `verifier`, the new target's health path must answer before the
    /// table is touched. The prefix is normalized and checked for conflicts
    /// against every other route.
    pub async fn replace(
        &self,
        service_name: &str,
        mut route: ServiceRoute,
        verifier: Option<&dyn HealthProbe>,
    ) -> Result<Arc<ServiceRoute>, RegistryError> {
        if route.name != service_name {
            return Err(RegistryError::NameMismatch {
                expected: service_name.to_string(),
                given: route.name,
            });
        }
        route.path_prefix = normalize_path(&route.path_prefix)?;

        if let Some(probe) = verifier {
            probe
                .probe(&route)
                .await
                .map_err(|e| RegistryError::Unreachable {
                    service: service_name.to_string(),
                    reason: e.to_string(),
                })?;
        }

        let route = Arc::new(route);
        let previous = {
            let _guard = self.write_lock.lock();
            let current = self.table.load_full();
            let next = current.with_route(Arc::clone(&route))?;
            self.table.store(Arc::new(next));
            current.get(service_name)
        };

        tracing::info!(
            service = %service_name,
            prefix = %route.path_prefix,
            target = %route.target,
            "Service route replaced"
        );

        // No subscribers is fine; the health monitor may be disabled.
        let _ = self.events.send(RegistryEvent::RouteReplaced {
            previous,
            current: Arc::clone(&route),
        });
        Ok(route)
    }

    pub fn subscribe(&self) -> RegistryEventReceiver {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::test_route;
    use crate::observability::health::ProbeError;
    use async_trait::async_trait;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::from_routes(vec![
            test_route("loan-service", "/api/v1/loans", "http://127.0.0.1:8005"),
            test_route("loan-products", "/api/v1/loans/products", "http://127.0.0.1:8006"),
            test_route("profile-service", "/api/v1/profile", "http://127.0.0.1:8002"),
        ])
        .unwrap()
    }

    struct FixedProbe(bool);

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn probe(&self, _route: &ServiceRoute) -> Result<(), ProbeError> {
            if self.0 {
                Ok(())
            } else {
                Err(ProbeError::Unreachable("connection refused".to_string()))
            }
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/api//v1/./loans/").unwrap(), "/api/v1/loans");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("//").unwrap(), "/");
        assert!(normalize_path("/api/../admin").is_err());
        assert!(normalize_path("/api/%2E%2e/admin").is_err());
        assert!(normalize_path("api/v1").is_err());
        assert_eq!(normalize_path("/api/v1/..foo").unwrap(), "/api/v1/..foo");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let registry = registry();
        assert_eq!(
            registry.resolve("/api/v1/loans/products/123").unwrap().name,
            "loan-products"
        );
        assert_eq!(registry.resolve("/api/v1/loans/42").unwrap().name, "loan-service");
        assert_eq!(registry.resolve("/api/v1/loans").unwrap().name, "loan-service");
    }

    #[test]
    fn test_matching_respects_segment_boundaries() {
        let registry = registry();
        assert!(matches!(
            registry.resolve("/api/v1/loansx"),
            Err(RegistryError::NotFound { .. })
        ));
        assert!(matches!(
            registry.resolve("/API/v1/loans"),
            Err(RegistryError::NotFound { .. })
        ));
        assert_eq!(
            registry.resolve("/api//v1/./profile/me").unwrap().name,
            "profile-service"
        );
    }

    #[test]
    fn test_traversal_is_rejected_as_bad_request() {
        let err = registry().resolve("/api/v1/loans/../admin").unwrap_err();
        let err = GatewayError::from(err);
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_conflicting_prefixes_are_rejected() {
        let err = RouteTable::from_routes(vec![
            test_route("a", "/api/v1/loans", "http://127.0.0.1:1"),
            test_route("b", "/api/v1/loans", "http://127.0.0.1:2"),
        ])
        .unwrap_err();
        assert!(matches!(err, RegistryError::PrefixConflict { .. }));
    }

    #[tokio::test]
    async fn test_replace_swaps_route_and_keeps_old_arc_alive() {
        let registry = registry();
        let mut events = registry.subscribe();
        let before = registry.resolve("/api/v1/profile").unwrap();

        let replacement = test_route("profile-service", "/api/v1/profile/", "http://127.0.0.1:9002");
        registry
            .replace("profile-service", replacement, Some(&FixedProbe(true)))
            .await
            .unwrap();

        let after = registry.resolve("/api/v1/profile").unwrap();
        assert_eq!(after.target.as_str(), "http://127.0.0.1:9002/");
        assert_eq!(after.path_prefix, "/api/v1/profile");
        assert_eq!(before.target.as_str(), "http://127.0.0.1:8002/");

        let RegistryEvent::RouteReplaced { previous, current } = events.recv().await.unwrap();
        assert_eq!(previous.unwrap().target, before.target);
        assert_eq!(current.target, after.target);
    }

    #[tokio::test]
    async fn test_replace_rejects_conflict_without_changing_table() {
        let registry = registry();
        let clash = test_route("profile-service", "/api/v1/loans", "http://127.0.0.1:9002");
        let err = registry.replace("profile-service", clash, None).await.unwrap_err();
        assert!(matches!(err, RegistryError::PrefixConflict { .. }));
        assert_eq!(
            registry.resolve("/api/v1/profile").unwrap().target.as_str(),
            "http://127.0.0.1:8002/"
        );
    }

    #[tokio::test]
    async fn test_replace_with_unreachable_target_fails() {
        let registry = registry();
        let route = test_route("profile-service", "/api/v1/profile", "http://127.0.0.1:9");
        let err = registry
            .replace("profile-service", route, Some(&FixedProbe(false)))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_replace_adds_new_service() {
        let registry = registry();
        let route = test_route("audit-service", "/api/v1/audit", "http://127.0.0.1:8007");
        registry.replace("audit-service", route, None).await.unwrap();
        assert_eq!(registry.routes().len(), 4);
        assert_eq!(registry.resolve("/api/v1/audit/logs").unwrap().name, "audit-service");
    }
}

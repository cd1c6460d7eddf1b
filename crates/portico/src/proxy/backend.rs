//! Backend endpoints, per-tenant pools, and selection.
//!
//! Backends, pools, and the registry are built once at startup from the
//! configuration and are immutable afterwards; only the atomic fields
//! inside a backend (liveness, breaker state, counters) change at runtime.

use crate::models::error::GatewayError;
use crate::models::settings::{ServiceEndpoint, Settings};
use crate::proxy::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use log::info;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// One upstream HTTP endpoint: the unit of health and breaker state.
#[derive(Debug)]
pub struct Backend {
    /// Service name from configuration (unique per tenant).
    pub name: String,
    /// `http` or `https`.
    pub scheme: String,
    /// `host` or `host:port`, IPv6 hosts bracketed.
    pub authority: String,
    /// Path component of the configured URL, prepended to proxied paths.
    /// Empty when the URL has no meaningful path.
    pub base_path: String,
    /// Query component of the configured URL, prepended to request queries.
    pub base_query: Option<String>,
    /// Health probe path; `None` means optimistically alive.
    pub health_path: Option<String>,
    alive: AtomicBool,
    /// Circuit breaker driven by proxy outcomes.
    pub breaker: CircuitBreaker,
}

impl Backend {
    /// Builds a backend from a configured service endpoint.
    ///
    /// Parses the URL into the parts the proxy director needs. Fails with
    /// [`GatewayError::Startup`] when the URL cannot be parsed or lacks a
    /// host.
    pub fn from_endpoint(
        tenant: &str,
        endpoint: &ServiceEndpoint,
        breaker_config: BreakerConfig,
    ) -> Result<Self, GatewayError> {
        let url = reqwest::Url::parse(&endpoint.url).map_err(|e| {
            GatewayError::Startup(format!(
                "tenant '{}' service '{}' has invalid URL '{}': {}",
                tenant, endpoint.name, endpoint.url, e
            ))
        })?;

        let host = url.host_str().ok_or_else(|| {
            GatewayError::Startup(format!(
                "tenant '{}' service '{}' URL '{}' has no host",
                tenant, endpoint.name, endpoint.url
            ))
        })?;

        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let base_path = match url.path() {
            "/" | "" => String::new(),
            path => path.trim_end_matches('/').to_string(),
        };

        let breaker_name = format!("{}/{}", tenant, authority);

        Ok(Self {
            name: endpoint.name.clone(),
            scheme: url.scheme().to_string(),
            authority,
            base_path,
            base_query: url.query().map(str::to_string),
            health_path: endpoint.health_path.clone(),
            alive: AtomicBool::new(true),
            breaker: CircuitBreaker::new(breaker_name, breaker_config),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Flips liveness; returns the previous value so callers can log
    /// transitions exactly once.
    pub fn set_alive(&self, alive: bool) -> bool {
        self.alive.swap(alive, Ordering::Relaxed)
    }

    /// `scheme://authority`, the base every outbound URL starts from.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.authority)
    }
}

/// Per-tenant backend pool with a shared round-robin cursor.
#[derive(Debug)]
pub struct TenantPool {
    pub name: String,
    backends: Vec<Arc<Backend>>,
    cursor: AtomicUsize,
}

impl TenantPool {
    pub fn new(name: String, backends: Vec<Arc<Backend>>) -> Self {
        Self {
            name,
            backends,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Selects the backend for the next proxied request.
    ///
    /// Round-robin over the pool, skipping dead backends and consulting
    /// each candidate's breaker (`try_admit`). When every backend is
    /// excluded, degrades in order: first alive backend ignoring breakers,
    /// first backend whose breaker is not open, then `backends[0]` — a
    /// misbehaving breaker must not make the pool unavailable.
    ///
    /// Returns `None` only for an empty pool.
    pub fn select(&self) -> Option<Arc<Backend>> {
        let n = self.backends.len();
        if n == 0 {
            return None;
        }

        for _ in 0..n {
            // Wrapping fetch_add keeps the modulo positive.
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
            let backend = &self.backends[idx];

            if !backend.is_alive() {
                continue;
            }
            if backend.breaker.try_admit() {
                return Some(Arc::clone(backend));
            }
        }

        // Degraded fallbacks.
        if let Some(backend) = self.backends.iter().find(|b| b.is_alive()) {
            return Some(Arc::clone(backend));
        }
        if let Some(backend) = self
            .backends
            .iter()
            .find(|b| b.breaker.state() != CircuitState::Open)
        {
            return Some(Arc::clone(backend));
        }
        Some(Arc::clone(&self.backends[0]))
    }
}

/// All tenant pools, keyed by tenant name.
///
/// Written once at startup; requests only read.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    pools: RwLock<ahash::AHashMap<String, Arc<TenantPool>>>,
}

impl BackendRegistry {
    /// Builds every tenant pool from the configuration.
    ///
    /// Emits `tenant_initialized` and `backend_created` log events per
    /// tenant and service.
    pub fn build(settings: &Settings) -> Result<Self, GatewayError> {
        let registry = Self::default();
        let breaker_config = BreakerConfig::from(&settings.breaker);

        let mut pools = registry.pools.write().expect("registry lock poisoned");
        for tenant in &settings.tenants {
            let mut backends = Vec::with_capacity(tenant.services.len());
            for service in &tenant.services {
                let backend =
                    Backend::from_endpoint(&tenant.name, service, breaker_config.clone())?;
                info!(
                    "component=proxy event=backend_created tenant={} service={} url={}",
                    tenant.name,
                    service.name,
                    backend.origin()
                );
                backends.push(Arc::new(backend));
            }

            info!(
                "component=gateway event=tenant_initialized tenant={} services={} routes={}",
                tenant.name,
                tenant.services.len(),
                tenant.routes.len()
                    + tenant
                        .route_groups
                        .iter()
                        .map(|g| g.routes.len())
                        .sum::<usize>()
            );

            pools.insert(
                tenant.name.clone(),
                Arc::new(TenantPool::new(tenant.name.clone(), backends)),
            );
        }
        drop(pools);

        Ok(registry)
    }

    pub fn pool(&self, tenant: &str) -> Option<Arc<TenantPool>> {
        self.pools
            .read()
            .expect("registry lock poisoned")
            .get(tenant)
            .cloned()
    }

    /// Snapshot of every pool, used by the health checker at spawn time.
    pub fn pools(&self) -> Vec<Arc<TenantPool>> {
        self.pools
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, url: &str) -> ServiceEndpoint {
        ServiceEndpoint {
            name: name.to_string(),
            url: url.to_string(),
            health_path: None,
        }
    }

    fn backend(name: &str, url: &str) -> Arc<Backend> {
        Arc::new(
            Backend::from_endpoint("t1", &endpoint(name, url), BreakerConfig::default()).unwrap(),
        )
    }

    #[test]
    fn url_parts_are_decomposed() {
        let b = backend("s1", "http://b1:9000/root?a=1");
        assert_eq!(b.scheme, "http");
        assert_eq!(b.authority, "b1:9000");
        assert_eq!(b.base_path, "/root");
        assert_eq!(b.base_query.as_deref(), Some("a=1"));
        assert_eq!(b.origin(), "http://b1:9000");
    }

    #[test]
    fn bare_url_has_empty_base_path() {
        let b = backend("s1", "http://b1:9000");
        assert_eq!(b.base_path, "");
        assert_eq!(b.base_query, None);
    }

    #[test]
    fn ipv6_authority_keeps_brackets() {
        let b = backend("s1", "http://[::1]:8080");
        assert_eq!(b.authority, "[::1]:8080");
    }

    #[test]
    fn invalid_url_is_a_startup_error() {
        let err = Backend::from_endpoint("t1", &endpoint("s1", "http://"), BreakerConfig::default())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Startup(_)));
    }

    #[test]
    fn round_robin_cycles_through_alive_backends() {
        let pool = TenantPool::new(
            "t1".to_string(),
            vec![
                backend("a", "http://a:1"),
                backend("b", "http://b:1"),
                backend("c", "http://c:1"),
            ],
        );

        let names: Vec<String> = (0..6).map(|_| pool.select().unwrap().name.clone()).collect();
        assert_eq!(names, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn dead_backends_are_skipped() {
        let pool = TenantPool::new(
            "t1".to_string(),
            vec![backend("a", "http://a:1"), backend("b", "http://b:1")],
        );
        pool.backends()[0].set_alive(false);

        for _ in 0..4 {
            assert_eq!(pool.select().unwrap().name, "b");
        }
    }

    #[test]
    fn open_breaker_excludes_backend() {
        let pool = TenantPool::new(
            "t1".to_string(),
            vec![backend("a", "http://a:1"), backend("b", "http://b:1")],
        );
        for _ in 0..5 {
            pool.backends()[1].breaker.record_failure();
        }
        assert_eq!(pool.backends()[1].breaker.state(), CircuitState::Open);

        for _ in 0..4 {
            assert_eq!(pool.select().unwrap().name, "a");
        }
    }

    #[test]
    fn all_dead_falls_back_to_first_non_open_breaker() {
        let pool = TenantPool::new(
            "t1".to_string(),
            vec![backend("a", "http://a:1"), backend("b", "http://b:1")],
        );
        pool.backends()[0].set_alive(false);
        pool.backends()[1].set_alive(false);
        for _ in 0..5 {
            pool.backends()[0].breaker.record_failure();
        }

        // a's breaker is open, b's is closed: b wins the fallback.
        assert_eq!(pool.select().unwrap().name, "b");
    }

    #[test]
    fn dead_but_alive_flagged_backend_beats_tripped_breaker() {
        let pool = TenantPool::new(
            "t1".to_string(),
            vec![backend("a", "http://a:1"), backend("b", "http://b:1")],
        );
        // Both breakers open, only b alive: degraded fallback 1 picks b.
        for backend in pool.backends() {
            for _ in 0..5 {
                backend.breaker.record_failure();
            }
        }
        pool.backends()[0].set_alive(false);

        assert_eq!(pool.select().unwrap().name, "b");
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let pool = TenantPool::new("t1".to_string(), Vec::new());
        assert!(pool.select().is_none());
    }

    #[test]
    fn registry_builds_pools_per_tenant() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "version": 1,
                "tenants": [{
                    "name": "t1",
                    "services": [
                        {"name": "s1", "url": "http://b1:9000"},
                        {"name": "s2", "url": "http://b2:9000"}
                    ]
                }]
            }"#,
        )
        .unwrap();

        let registry = BackendRegistry::build(&settings).unwrap();
        let pool = registry.pool("t1").unwrap();
        assert_eq!(pool.backends().len(), 2);
        assert!(registry.pool("missing").is_none());
    }
}

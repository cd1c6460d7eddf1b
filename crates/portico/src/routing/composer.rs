//! Router composition.
//!
//! Builds the immutable routing table at startup: one radix router per
//! HTTP method whose values index a flat list of [`RouteTarget`]s.
//! Patterns are the concatenation of tenant mount, group pattern, and
//! route pattern, so deeper mounts win by construction and matching stays
//! O(path length). Script-registered routes merge in after declarative
//! configuration.

use crate::models::error::GatewayError;
use crate::models::settings::{RouteRule, Settings, Tenant};
use crate::scripting::registry::RegistrationSet;
use log::debug;

/// What a matched route dispatches to.
#[derive(Debug, Clone)]
pub enum HandlerKind {
    /// Script handler function, resolved through the runtime on first use.
    Script(String),
    /// Reverse proxy to the tenant's backend pool.
    Proxy,
}

/// The resolved dispatch data for one bound route.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub tenant: String,
    /// Script middleware names, outermost first: pattern-scoped script
    /// middleware, then group middleware, then route middleware.
    pub middleware: Vec<String>,
    pub handler: HandlerKind,
    /// Mount prefix consumed during routing, stripped before proxying.
    pub strip_prefix: Option<String>,
}

/// Custom error handlers for a tenant scope, resolved by longest prefix.
#[derive(Debug, Clone)]
pub struct TenantErrorHandlers {
    pub prefix: String,
    pub tenant: String,
    pub not_found: Option<String>,
    pub method_not_allowed: Option<String>,
}

/// Outcome of a routing lookup.
pub enum RouteMatch<'a> {
    Found {
        target: &'a RouteTarget,
        params: Vec<(String, String)>,
    },
    MethodNotAllowed,
    NotFound,
}

/// The composed routing table: radix routers per method plus tenant error
/// handler resolution. Immutable after [`RouterTable::build`].
#[derive(Debug)]
pub struct RouterTable {
    methods: ahash::AHashMap<String, matchit::Router<usize>>,
    targets: Vec<RouteTarget>,
    error_handlers: Vec<TenantErrorHandlers>,
}

/// Joins mount fragments into one pattern, collapsing duplicate slashes
/// at the seams and guaranteeing a leading slash.
fn join_patterns(parts: &[&str]) -> String {
    let mut joined = String::new();
    for part in parts {
        let part = part.trim_end_matches('/');
        if part.is_empty() {
            continue;
        }
        joined.push_str(part);
    }
    if joined.is_empty() {
        "/".to_string()
    } else {
        joined
    }
}

/// Normalizes an optional mount prefix: no trailing slash, `None` for the
/// bare root.
fn normalize_prefix(prefix: Option<&str>) -> Option<String> {
    let prefix = prefix?.trim_end_matches('/');
    if prefix.is_empty() {
        None
    } else {
        Some(prefix.to_string())
    }
}

impl RouterTable {
    /// Composes the table from declarative configuration plus script
    /// registrations.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Startup`] for duplicate `(method, pattern)` bindings
    /// and patterns matchit rejects.
    pub fn build(
        settings: &Settings,
        registrations: &RegistrationSet,
    ) -> Result<Self, GatewayError> {
        let mut table = Self {
            methods: ahash::AHashMap::new(),
            targets: Vec::new(),
            error_handlers: Vec::new(),
        };

        for tenant in &settings.tenants {
            let mount = normalize_prefix(tenant.path_prefix.as_deref());
            table.add_tenant(tenant, mount.as_deref(), registrations)?;
        }

        table.add_script_only_tenants(settings, registrations)?;

        // Longest prefix first so the dispatcher's error handler lookup
        // finds the deepest matching tenant scope.
        table
            .error_handlers
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(table)
    }

    fn add_tenant(
        &mut self,
        tenant: &Tenant,
        mount: Option<&str>,
        registrations: &RegistrationSet,
    ) -> Result<(), GatewayError> {
        let mount_str = mount.unwrap_or("");

        // Script routes and middleware for this tenant resolve against
        // mount() when the startup scripts called it, otherwise against
        // the declared prefix.
        let script_mount = registrations
            .mounts
            .get(&tenant.name)
            .map(|m| normalize_prefix(Some(m)))
            .unwrap_or_else(|| mount.map(str::to_string));
        let script_mount_str = script_mount.as_deref().unwrap_or("");

        for route in &tenant.routes {
            let pattern = join_patterns(&[mount_str, &route.pattern]);
            let middleware = self.middleware_for(
                &tenant.name,
                &pattern,
                registrations,
                script_mount_str,
                &[],
                route,
            );
            self.bind(&tenant.name, route, &pattern, middleware, mount)?;
        }

        for group in &tenant.route_groups {
            for route in &group.routes {
                let pattern = join_patterns(&[mount_str, &group.pattern, &route.pattern]);
                let middleware = self.middleware_for(
                    &tenant.name,
                    &pattern,
                    registrations,
                    script_mount_str,
                    &group.middleware,
                    route,
                );
                self.bind(&tenant.name, route, &pattern, middleware, mount)?;
            }
        }

        for route in registrations.routes.iter().filter(|r| r.tenant == tenant.name) {
            let pattern = join_patterns(&[script_mount_str, &route.pattern]);
            let mut middleware =
                self.pattern_middleware(&tenant.name, &pattern, registrations, script_mount_str);
            middleware.extend(route.middleware.iter().cloned());
            self.insert(
                &route.method,
                &pattern,
                RouteTarget {
                    tenant: tenant.name.clone(),
                    middleware,
                    handler: HandlerKind::Script(route.handler.clone()),
                    strip_prefix: script_mount.clone(),
                },
            )?;
        }

        if let Some(handlers) = &tenant.error_handlers {
            self.error_handlers.push(TenantErrorHandlers {
                prefix: mount_str.to_string(),
                tenant: tenant.name.clone(),
                not_found: handlers.not_found.clone(),
                method_not_allowed: handlers.method_not_allowed.clone(),
            });
        }

        Ok(())
    }

    /// Tenants that only exist through script `mount()` calls.
    fn add_script_only_tenants(
        &mut self,
        settings: &Settings,
        registrations: &RegistrationSet,
    ) -> Result<(), GatewayError> {
        for route in &registrations.routes {
            if settings.tenants.iter().any(|t| t.name == route.tenant) {
                continue;
            }
            let mount = registrations
                .mounts
                .get(&route.tenant)
                .and_then(|m| normalize_prefix(Some(m)));
            let mount_str = mount.as_deref().unwrap_or("");
            let pattern = join_patterns(&[mount_str, &route.pattern]);
            let mut middleware =
                self.pattern_middleware(&route.tenant, &pattern, registrations, mount_str);
            middleware.extend(route.middleware.iter().cloned());
            self.insert(
                &route.method,
                &pattern,
                RouteTarget {
                    tenant: route.tenant.clone(),
                    middleware,
                    handler: HandlerKind::Script(route.handler.clone()),
                    strip_prefix: mount,
                },
            )?;
        }
        Ok(())
    }

    fn middleware_for(
        &self,
        tenant: &str,
        full_pattern: &str,
        registrations: &RegistrationSet,
        script_mount: &str,
        group_middleware: &[String],
        route: &RouteRule,
    ) -> Vec<String> {
        let mut chain = self.pattern_middleware(tenant, full_pattern, registrations, script_mount);
        chain.extend(group_middleware.iter().cloned());
        chain.extend(route.middleware.iter().cloned());
        chain
    }

    /// Script middleware whose pattern prefixes this route's full pattern;
    /// the outermost layer of the tenant chain.
    fn pattern_middleware(
        &self,
        tenant: &str,
        full_pattern: &str,
        registrations: &RegistrationSet,
        script_mount: &str,
    ) -> Vec<String> {
        registrations
            .middlewares
            .iter()
            .filter(|m| m.tenant == tenant)
            .filter(|m| {
                let mw_pattern = join_patterns(&[script_mount, &m.pattern]);
                if mw_pattern == "/" {
                    return true;
                }
                match full_pattern.strip_prefix(mw_pattern.as_str()) {
                    Some("") => true,
                    Some(rest) => rest.starts_with('/'),
                    None => false,
                }
            })
            .map(|m| m.name.clone())
            .collect()
    }

    fn bind(
        &mut self,
        tenant: &str,
        route: &RouteRule,
        pattern: &str,
        middleware: Vec<String>,
        mount: Option<&str>,
    ) -> Result<(), GatewayError> {
        let handler = match (&route.handler, &route.backend) {
            (Some(name), None) => HandlerKind::Script(name.clone()),
            (None, Some(_)) => HandlerKind::Proxy,
            _ => {
                return Err(GatewayError::Startup(format!(
                    "tenant '{}' route {} {} must set exactly one of handler or backend",
                    tenant, route.method, route.pattern
                )))
            }
        };

        self.insert(
            &route.method,
            pattern,
            RouteTarget {
                tenant: tenant.to_string(),
                middleware,
                handler,
                strip_prefix: mount.map(str::to_string),
            },
        )
    }

    fn insert(
        &mut self,
        method: &str,
        pattern: &str,
        target: RouteTarget,
    ) -> Result<(), GatewayError> {
        let index = self.targets.len();
        let router = self
            .methods
            .entry(method.to_uppercase())
            .or_insert_with(matchit::Router::new);

        router.insert(pattern.to_string(), index).map_err(|e| {
            GatewayError::Startup(format!(
                "cannot bind route {} {}: {}",
                method, pattern, e
            ))
        })?;

        debug!(
            "component=gateway event=route_bound tenant={} method={} pattern={}",
            target.tenant, method, pattern
        );
        self.targets.push(target);
        Ok(())
    }

    /// Resolves a request to a route, distinguishing an unknown path from
    /// a known path with the wrong method.
    pub fn lookup(&self, method: &str, path: &str) -> RouteMatch<'_> {
        if let Some(router) = self.methods.get(&method.to_uppercase()) {
            if let Ok(matched) = router.at(path) {
                let params = matched
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                return RouteMatch::Found {
                    target: &self.targets[*matched.value],
                    params,
                };
            }
        }

        // Any other method binding the same path makes this a 405.
        for (other_method, router) in &self.methods {
            if other_method != method && router.at(path).is_ok() {
                return RouteMatch::MethodNotAllowed;
            }
        }

        RouteMatch::NotFound
    }

    /// The deepest tenant error handler scope covering `path`, if any.
    pub fn error_handlers_for(&self, path: &str) -> Option<&TenantErrorHandlers> {
        self.error_handlers.iter().find(|handlers| {
            if handlers.prefix.is_empty() {
                return true;
            }
            match path.strip_prefix(handlers.prefix.as_str()) {
                Some("") => true,
                Some(rest) => rest.starts_with('/'),
                None => false,
            }
        })
    }

    /// Number of bound routes; used by startup logging.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

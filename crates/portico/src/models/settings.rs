use serde::{Deserialize, Serialize};

/// A single route owned by a tenant.
///
/// Exactly one of `handler` (a script function name) or `backend` (a tenant
/// service name) must be set; `validate` enforces this.
///
/// # Examples
///
/// ```json
/// {
///   "method": "GET",
///   "pattern": "/users/{id}",
///   "middleware": ["auth"],
///   "backend": "users"
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RouteRule {
    /// HTTP method this route answers to (`GET`, `POST`, ...).
    pub method: String,

    /// Path pattern relative to the enclosing mount.
    /// Supports `{name}` path parameters. Must start with `/`.
    pub pattern: String,

    /// Script middleware names wrapping the handler, outermost first.
    #[serde(default)]
    pub middleware: Vec<String>,

    /// Script handler name. Mutually exclusive with `backend`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    /// Name of a tenant service to reverse-proxy to.
    /// Mutually exclusive with `handler`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

const VALID_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE",
];

impl RouteRule {
    /// Validates method, pattern shape, and the handler/backend exclusivity.
    pub fn validate(&self) -> Result<(), String> {
        if !VALID_METHODS.contains(&self.method.as_str()) {
            return Err(format!("Invalid HTTP method: {}", self.method));
        }

        if !self.pattern.starts_with('/') {
            return Err(format!("Route pattern must start with '/': {}", self.pattern));
        }

        match (&self.handler, &self.backend) {
            (Some(_), Some(_)) => Err(format!(
                "Route {} {} sets both handler and backend",
                self.method, self.pattern
            )),
            (None, None) => Err(format!(
                "Route {} {} sets neither handler nor backend",
                self.method, self.pattern
            )),
            _ => Ok(()),
        }
    }
}

/// A group of routes sharing a sub-mount and a middleware list.
///
/// The group `pattern` is relative to the tenant mount; every contained
/// route pattern is relative to the group.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RouteGroup {
    /// Sub-mount pattern relative to the tenant mount. Must start with `/`.
    pub pattern: String,

    /// Script middleware applied to every route in the group, outermost first.
    #[serde(default)]
    pub middleware: Vec<String>,

    /// Routes mounted under the group pattern.
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

impl RouteGroup {
    pub fn validate(&self) -> Result<(), String> {
        if !self.pattern.starts_with('/') {
            return Err(format!("Group pattern must start with '/': {}", self.pattern));
        }
        for route in &self.routes {
            route.validate()?;
        }
        Ok(())
    }
}

/// Script handler names replacing the default 404/405 responses for a tenant.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ErrorHandlers {
    /// Script handler invoked when no route matches inside the tenant mount.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_found: Option<String>,

    /// Script handler invoked when a path matches but the method does not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_not_allowed: Option<String>,
}

/// One upstream HTTP endpoint owned by a tenant.
///
/// The `name` is the identifier routes reference through their `backend`
/// field. The `url` must be absolute with scheme and host; an optional path
/// and query are prepended to proxied requests.
///
/// # Examples
///
/// ```json
/// { "name": "users", "url": "http://users:9000/root", "health_path": "/h" }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServiceEndpoint {
    /// Unique (per tenant) service name.
    pub name: String,

    /// Absolute backend URL, e.g. `http://backend:9000/base`.
    pub url: String,

    /// Optional health probe path. When set, a background worker probes
    /// `GET {scheme}://{host}{health_path}` and flips the backend's
    /// liveness. Absent means the backend is optimistically alive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
}

impl ServiceEndpoint {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Service name cannot be empty".to_string());
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(format!(
                "Service '{}' URL must start with http:// or https://: {}",
                self.name, self.url
            ));
        }
        if let Some(path) = &self.health_path {
            if !path.starts_with('/') {
                return Err(format!(
                    "Service '{}' health_path must start with '/': {}",
                    self.name, path
                ));
            }
        }
        Ok(())
    }
}

/// A named routing scope: mount prefix, routes, groups, error handlers, and
/// backend services.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Tenant {
    /// Unique tenant name, used in logs and service lookups.
    pub name: String,

    /// Optional mount prefix. When present, every tenant route is mounted
    /// under it and the prefix is stripped before proxying. Must start
    /// with `/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,

    /// Routes mounted directly under the tenant mount.
    #[serde(default)]
    pub routes: Vec<RouteRule>,

    /// Nested sub-mounts with group-level middleware.
    #[serde(default)]
    pub route_groups: Vec<RouteGroup>,

    /// Custom 404/405 script handlers for the tenant scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handlers: Option<ErrorHandlers>,

    /// Backend services addressable from routes via `backend`.
    #[serde(default)]
    pub services: Vec<ServiceEndpoint>,
}

impl Tenant {
    /// Validates the tenant shape: prefix form, route and service
    /// well-formedness, unique service names, and backend references.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Tenant name cannot be empty".to_string());
        }

        if let Some(prefix) = &self.path_prefix {
            if !prefix.starts_with('/') {
                return Err(format!(
                    "Tenant '{}' path_prefix must start with '/': {}",
                    self.name, prefix
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !seen.insert(service.name.as_str()) {
                return Err(format!(
                    "Tenant '{}' declares service '{}' more than once",
                    self.name, service.name
                ));
            }
        }

        for route in &self.routes {
            route.validate()?;
            self.check_backend_ref(route)?;
        }
        for group in &self.route_groups {
            group.validate()?;
            for route in &group.routes {
                self.check_backend_ref(route)?;
            }
        }

        Ok(())
    }

    fn check_backend_ref(&self, route: &RouteRule) -> Result<(), String> {
        if let Some(backend) = &route.backend {
            if !self.services.iter().any(|s| &s.name == backend) {
                return Err(format!(
                    "Tenant '{}' route {} {} references undefined service '{}'",
                    self.name, route.method, route.pattern, backend
                ));
            }
        }
        Ok(())
    }
}

/// Embedded scripting runtime configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScriptingSettings {
    /// Master switch for the scripting plane. When off, script handlers
    /// fail with 500 and `/debug/script-pool` is not registered.
    #[serde(default)]
    pub enabled: bool,

    /// Directory scanned for `.rhai` script files. The file stem is the
    /// script's logical name.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: String,

    /// Logical names of scripts executed once at startup, in order, before
    /// any directory-scanned `global-*` scripts.
    #[serde(default)]
    pub global_scripts: Vec<String>,

    /// Maximum number of pooled interpreters.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Additional directories searched by `import` statements.
    #[serde(default)]
    pub module_paths: Vec<String>,
}

fn default_scripts_dir() -> String {
    "./scripts".to_string()
}

fn default_pool_size() -> usize {
    10
}

impl Default for ScriptingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            scripts_dir: default_scripts_dir(),
            global_scripts: Vec::new(),
            pool_size: default_pool_size(),
            module_paths: Vec::new(),
        }
    }
}

/// Global middleware switches and knobs.
///
/// The execution order of the global chain is fixed (request-id, real-ip,
/// logger, recovery, timeout, throttle, size limit, compression, path
/// cleaning); these flags only enable or disable individual members.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MiddlewareSettings {
    /// Echo (and generate when absent) `X-Request-Id`.
    #[serde(default = "default_true")]
    pub request_id: bool,

    /// Derive the client IP from forwarded headers.
    #[serde(default = "default_true")]
    pub real_ip: bool,

    /// Emit one structured access log line per request.
    #[serde(default = "default_true")]
    pub logging: bool,

    /// Trap handler panics into 500 responses.
    #[serde(default = "default_true")]
    pub recovery: bool,

    /// Per-request deadline in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Maximum in-flight requests across the process. `0` disables the
    /// throttle.
    #[serde(default)]
    pub max_concurrent: usize,
}

fn default_true() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for MiddlewareSettings {
    fn default() -> Self {
        Self {
            request_id: true,
            real_ip: true,
            logging: true,
            recovery: true,
            timeout_seconds: default_timeout_seconds(),
            max_concurrent: 0,
        }
    }
}

/// Response compression configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompressionSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Compression level, 1 (fastest) to 9 (smallest).
    #[serde(default = "default_compression_level")]
    pub level: u32,

    /// Content types eligible for compression.
    #[serde(default)]
    pub content_types: Vec<String>,
}

fn default_compression_level() -> u32 {
    6
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: default_compression_level(),
            content_types: Vec::new(),
        }
    }
}

impl CompressionSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.level < 1 || self.level > 9 {
            return Err(format!(
                "Compression level must be between 1 and 9, got {}",
                self.level
            ));
        }
        Ok(())
    }
}

/// Request intake limits.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LimitSettings {
    /// Maximum request body size in bytes. Bodies at the limit succeed;
    /// one byte over is rejected.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Background health probe cadence.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthSettings {
    /// Seconds between probes of each backend's health path.
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,

    /// Per-probe HTTP timeout in seconds.
    #[serde(default = "default_health_timeout")]
    pub timeout_seconds: u64,
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_health_interval(),
            timeout_seconds: default_health_timeout(),
        }
    }
}

/// Circuit breaker tuning shared by every backend.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BreakerSettings {
    /// Consecutive failures opening a closed breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open breaker waits before admitting probes.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Probe budget granted when transitioning to half-open.
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_half_open_probes() -> u32 {
    1
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            half_open_probes: default_half_open_probes(),
        }
    }
}

/// Complete gateway configuration.
///
/// Typically loaded from a JSON file by [`crate::config::settings::load_settings`]
/// and checked by [`crate::config::validation::ConfigValidator`] before the
/// gateway starts.
///
/// # Configuration File Format
///
/// ```json
/// {
///   "version": 1,
///   "tenants": [
///     {
///       "name": "t1",
///       "path_prefix": "/api",
///       "services": [{ "name": "s1", "url": "http://b1:9000/root" }],
///       "routes": [{ "method": "GET", "pattern": "/users", "backend": "s1" }]
///     }
///   ],
///   "scripting": { "enabled": true, "scripts_dir": "./scripts" }
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Settings {
    /// Configuration schema version for compatibility checking.
    pub version: u8,

    /// Routing scopes served by this instance.
    #[serde(default)]
    pub tenants: Vec<Tenant>,

    /// Embedded scripting runtime settings.
    #[serde(default)]
    pub scripting: ScriptingSettings,

    /// Global middleware switches.
    #[serde(default)]
    pub middleware: MiddlewareSettings,

    /// Response compression settings.
    #[serde(default)]
    pub compression: CompressionSettings,

    /// Request intake limits.
    #[serde(default)]
    pub limits: LimitSettings,

    /// Health probe cadence.
    #[serde(default)]
    pub health: HealthSettings,

    /// Circuit breaker tuning.
    #[serde(default)]
    pub breaker: BreakerSettings,
}

impl Settings {
    /// Validates the whole configuration tree.
    ///
    /// Checks tenant uniqueness and shape, compression bounds, and the
    /// scripting pool size. Returns the first error encountered.
    pub fn validate(&self) -> Result<(), String> {
        let mut names = std::collections::HashSet::new();
        for tenant in &self.tenants {
            tenant.validate()?;
            if !names.insert(tenant.name.as_str()) {
                return Err(format!("Duplicate tenant name '{}'", tenant.name));
            }
        }

        self.compression.validate()?;

        if self.scripting.enabled && self.scripting.pool_size == 0 {
            return Err("Scripting pool_size must be at least 1".to_string());
        }

        if self.middleware.timeout_seconds == 0 {
            return Err("Middleware timeout_seconds must be at least 1".to_string());
        }

        Ok(())
    }
}

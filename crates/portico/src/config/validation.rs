//! Configuration validation with detailed error reporting.
//!
//! Startup-time checks over the loaded [`Settings`]: the structural rules
//! every tenant must satisfy, plus non-fatal warnings for shapes that are
//! legal but probably unintended.

use crate::models::settings::Settings;
use std::collections::HashSet;

/// Result of configuration validation containing errors and warnings.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Critical errors that prevent the gateway from starting.
    pub errors: Vec<String>,
    /// Non-critical issues that should be addressed.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no errors were recorded.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

/// Startup configuration validator.
///
/// Wraps the per-type `validate` methods on the settings model and layers
/// cross-cutting checks on top: duplicate (method, pattern) pairs within a
/// tenant scope, script references without scripting enabled, and throttle
/// or pool sizes that defeat their purpose.
///
/// # Examples
///
/// ```
/// use portico::config::validation::ConfigValidator;
/// use portico::models::settings::Settings;
///
/// let settings: Settings = serde_json::from_str(r#"{"version": 1}"#).unwrap();
/// let result = ConfigValidator::validate(&settings);
/// assert!(result.is_valid());
/// ```
pub struct ConfigValidator;

impl ConfigValidator {
    /// Performs full validation of gateway settings.
    pub fn validate(settings: &Settings) -> ValidationResult {
        let mut result = ValidationResult::new();

        if let Err(e) = settings.validate() {
            result.add_error(e);
        }

        Self::check_duplicate_routes(settings, &mut result);
        Self::check_script_references(settings, &mut result);
        Self::check_limits(settings, &mut result);

        result
    }

    /// Route = (method, pattern) must be unique within a tenant scope,
    /// where group routes live under the group pattern.
    fn check_duplicate_routes(settings: &Settings, result: &mut ValidationResult) {
        for tenant in &settings.tenants {
            let mut seen: HashSet<(String, String)> = HashSet::new();

            for route in &tenant.routes {
                let key = (route.method.clone(), route.pattern.clone());
                if !seen.insert(key) {
                    result.add_error(format!(
                        "Tenant '{}' declares duplicate route {} {}",
                        tenant.name, route.method, route.pattern
                    ));
                }
            }

            for group in &tenant.route_groups {
                for route in &group.routes {
                    let scoped = format!("{}{}", group.pattern, route.pattern);
                    let key = (route.method.clone(), scoped.clone());
                    if !seen.insert(key) {
                        result.add_error(format!(
                            "Tenant '{}' declares duplicate route {} {}",
                            tenant.name, route.method, scoped
                        ));
                    }
                }
            }
        }
    }

    fn check_script_references(settings: &Settings, result: &mut ValidationResult) {
        if settings.scripting.enabled {
            return;
        }

        for tenant in &settings.tenants {
            let handler_routes = tenant
                .routes
                .iter()
                .chain(tenant.route_groups.iter().flat_map(|g| g.routes.iter()))
                .filter(|r| r.handler.is_some())
                .count();

            if handler_routes > 0 {
                result.add_warning(format!(
                    "Tenant '{}' has {} script handler route(s) but scripting is disabled; \
                     they will respond with 500",
                    tenant.name, handler_routes
                ));
            }

            if tenant.error_handlers.is_some() {
                result.add_warning(format!(
                    "Tenant '{}' configures error handlers but scripting is disabled",
                    tenant.name
                ));
            }
        }
    }

    fn check_limits(settings: &Settings, result: &mut ValidationResult) {
        if settings.limits.max_body_bytes == 0 {
            result.add_error("limits.max_body_bytes must be greater than 0".to_string());
        }

        if settings.middleware.max_concurrent > 0 && settings.middleware.max_concurrent < 4 {
            result.add_warning(format!(
                "middleware.max_concurrent={} is very low and will serialize traffic",
                settings.middleware.max_concurrent
            ));
        }

        if settings.health.interval_seconds == 0 {
            result.add_error("health.interval_seconds must be greater than 0".to_string());
        }

        if settings.breaker.failure_threshold == 0 {
            result.add_error("breaker.failure_threshold must be greater than 0".to_string());
        }

        if settings.breaker.half_open_probes == 0 {
            result.add_error("breaker.half_open_probes must be greater than 0".to_string());
        }
    }
}

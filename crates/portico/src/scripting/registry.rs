//! Route registration from startup scripts.
//!
//! `global-*` scripts run once during `Gateway::start` on a dedicated
//! engine that, in addition to the normal bridge, exposes the registration
//! surface: `mount`, `route`, `middleware`, `group`, and `clear`. The
//! calls accumulate into a [`RegistrationSet`] the router composer merges
//! after declarative configuration. Nothing here runs after startup; the
//! dispatcher never sees these functions.

use crate::models::error::GatewayError;
use crate::scripting::compiler::ScriptCache;
use log::info;
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, NativeCallContext, Position};
use std::sync::{Arc, Mutex};

/// A route registered from a script.
#[derive(Debug, Clone)]
pub struct ScriptRoute {
    pub tenant: String,
    pub method: String,
    /// Pattern relative to the tenant's script mount (group prefixes
    /// already folded in).
    pub pattern: String,
    pub middleware: Vec<String>,
    pub handler: String,
}

/// A pattern-scoped middleware registered from a script.
#[derive(Debug, Clone)]
pub struct ScriptMiddleware {
    pub tenant: String,
    pub pattern: String,
    pub name: String,
}

/// Everything the startup scripts registered.
#[derive(Debug, Clone, Default)]
pub struct RegistrationSet {
    pub routes: Vec<ScriptRoute>,
    pub middlewares: Vec<ScriptMiddleware>,
    /// Tenant name → mount path chosen via `mount()`. Overrides the
    /// tenant's declarative `path_prefix` for script routes; unknown
    /// tenants become script-only scopes.
    pub mounts: ahash::AHashMap<String, String>,
}

#[derive(Default)]
struct RegistrarState {
    current_tenant: Option<String>,
    group_prefix: Vec<String>,
    group_middleware: Vec<Vec<String>>,
    set: RegistrationSet,
}

impl RegistrarState {
    fn scoped_pattern(&self, pattern: &str) -> String {
        let mut full = String::new();
        for prefix in &self.group_prefix {
            full.push_str(prefix.trim_end_matches('/'));
        }
        full.push_str(pattern);
        full
    }

    fn scoped_middleware(&self) -> Vec<String> {
        self.group_middleware.iter().flatten().cloned().collect()
    }
}

/// Collects registrations made by startup scripts.
#[derive(Clone, Default)]
pub struct Registrar {
    state: Arc<Mutex<RegistrarState>>,
}

fn registration_error(message: String) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message),
        Position::NONE,
    ))
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the accumulated registration set, leaving the registrar
    /// empty.
    pub fn take(&self) -> RegistrationSet {
        std::mem::take(&mut self.state.lock().expect("registrar poisoned").set)
    }

    /// Installs the registration surface on the startup engine.
    pub fn install(&self, engine: &mut Engine) {
        let state = Arc::clone(&self.state);
        engine.register_fn("mount", move |tenant: &str, path: &str| {
            let mut state = state.lock().expect("registrar poisoned");
            state.current_tenant = Some(tenant.to_string());
            state
                .set
                .mounts
                .insert(tenant.to_string(), path.to_string());
        });

        let state = Arc::clone(&self.state);
        engine.register_fn(
            "route",
            move |method: &str, pattern: &str, handler: &str| -> Result<(), Box<EvalAltResult>> {
                let mut state = state.lock().expect("registrar poisoned");
                let tenant = state.current_tenant.clone().ok_or_else(|| {
                    registration_error(
                        "route() requires a prior mount(tenant, path) call".to_string(),
                    )
                })?;
                let route = ScriptRoute {
                    tenant,
                    method: method.to_uppercase(),
                    pattern: state.scoped_pattern(pattern),
                    middleware: state.scoped_middleware(),
                    handler: handler.to_string(),
                };
                state.set.routes.push(route);
                Ok(())
            },
        );

        let state = Arc::clone(&self.state);
        engine.register_fn(
            "middleware",
            move |pattern: &str, name: &str| -> Result<(), Box<EvalAltResult>> {
                let mut state = state.lock().expect("registrar poisoned");
                let tenant = state.current_tenant.clone().ok_or_else(|| {
                    registration_error(
                        "middleware() requires a prior mount(tenant, path) call".to_string(),
                    )
                })?;
                let mw = ScriptMiddleware {
                    tenant,
                    pattern: state.scoped_pattern(pattern),
                    name: name.to_string(),
                };
                state.set.middlewares.push(mw);
                Ok(())
            },
        );

        let state = Arc::clone(&self.state);
        engine.register_fn(
            "group",
            move |ctx: NativeCallContext,
                  pattern: &str,
                  middleware: rhai::Array,
                  body: FnPtr|
                  -> Result<(), Box<EvalAltResult>> {
                let names: Vec<String> = middleware
                    .into_iter()
                    .map(|item| {
                        item.into_string().map_err(|actual| {
                            registration_error(format!(
                                "group() middleware names must be strings, got {actual}"
                            ))
                        })
                    })
                    .collect::<Result<_, _>>()?;

                {
                    let mut state = state.lock().expect("registrar poisoned");
                    if state.current_tenant.is_none() {
                        return Err(registration_error(
                            "group() requires a prior mount(tenant, path) call".to_string(),
                        ));
                    }
                    state.group_prefix.push(pattern.to_string());
                    state.group_middleware.push(names);
                }

                // The lock is released while the body runs; the body calls
                // route()/middleware() which re-lock.
                let result = body.call_within_context::<Dynamic>(&ctx, ());

                let mut state = state.lock().expect("registrar poisoned");
                state.group_prefix.pop();
                state.group_middleware.pop();
                result.map(|_| ())
            },
        );

        let state = Arc::clone(&self.state);
        engine.register_fn("clear", move |tenant: &str| {
            let mut state = state.lock().expect("registrar poisoned");
            state.set.routes.retain(|r| r.tenant != tenant);
            state.set.middlewares.retain(|m| m.tenant != tenant);
        });
    }
}

/// Runs every startup script and returns what they registered.
///
/// Order: explicitly configured `global_scripts` first, then directory
/// `global-*` scripts (sorted), each executed once. A failing script
/// aborts startup with [`GatewayError::ScriptRuntime`].
pub fn run_global_scripts(
    engine: &Engine,
    registrar: &Registrar,
    cache: &ScriptCache,
    configured: &[String],
) -> Result<RegistrationSet, GatewayError> {
    let mut names: Vec<String> = configured.to_vec();
    match cache.global_script_names() {
        Ok(scanned) => {
            for name in scanned {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        // A missing scripts directory only matters once something needs a
        // script; startup proceeds with the configured list.
        Err(_) if configured.is_empty() => {}
        Err(e) => return Err(e),
    }

    for name in &names {
        let compiled = cache.load(engine, name)?;
        engine
            .run_ast(&compiled.ast)
            .map_err(|e| GatewayError::ScriptRuntime {
                name: name.clone(),
                message: e.to_string(),
            })?;
    }

    info!(
        "component=script event=script_global_scripts_completed count={}",
        names.len()
    );

    Ok(registrar.take())
}

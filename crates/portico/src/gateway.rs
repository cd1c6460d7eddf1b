//! Gateway lifecycle: compose at startup, serve, stop idempotently.

use crate::config::validation::ConfigValidator;
use crate::models::error::GatewayError;
use crate::models::settings::Settings;
use crate::proxy;
use crate::proxy::backend::BackendRegistry;
use crate::proxy::health::HealthChecker;
use crate::routing::composer::RouterTable;
use crate::routing::dispatcher::GatewayService;
use crate::scripting::compiler::ScriptCache;
use crate::scripting::pool::{self as script_pool, ScriptPool};
use crate::scripting::registry::{run_global_scripts, RegistrationSet, Registrar};

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A started gateway: the request service plus the background machinery
/// behind it.
///
/// Everything route- and backend-shaped is immutable once `start`
/// returns; `stop` cancels the health workers and closes the script pool
/// and may be called any number of times.
pub struct Gateway {
    service: GatewayService,
    pool: Option<Arc<ScriptPool>>,
    health: Mutex<Option<HealthChecker>>,
    stopped: AtomicBool,
}

impl Gateway {
    /// Validates the configuration, runs startup scripts, composes the
    /// router, and spawns the health workers.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Startup`] for invalid configuration, duplicate
    /// routes, or unknown backend references;
    /// [`GatewayError::ScriptRuntime`] /
    /// [`GatewayError::ScriptLoad`] when a startup script fails.
    pub async fn start(settings: Settings) -> Result<Self, GatewayError> {
        let validation = ConfigValidator::validate(&settings);
        for warning in &validation.warnings {
            warn!("component=gateway event=config_warning message={:?}", warning);
        }
        if !validation.is_valid() {
            return Err(GatewayError::Startup(validation.errors.join("; ")));
        }

        let registry = Arc::new(BackendRegistry::build(&settings)?);
        let cache = Arc::new(ScriptCache::new(&settings.scripting.scripts_dir));

        // Startup scripts run synchronously before the dispatcher exists,
        // so script registrations are complete before the first request.
        let registrations = if settings.scripting.enabled {
            let mut init = script_pool::build_engine(&settings.scripting);
            let registrar = Registrar::new();
            registrar.install(init.engine_mut());
            run_global_scripts(
                init.engine(),
                &registrar,
                &cache,
                &settings.scripting.global_scripts,
            )?
        } else {
            RegistrationSet::default()
        };

        let table = Arc::new(RouterTable::build(&settings, &registrations)?);
        info!(
            "component=gateway event=router_composed tenants={} routes={}",
            settings.tenants.len(),
            table.len()
        );

        let pool = settings
            .scripting
            .enabled
            .then(|| ScriptPool::new(settings.scripting.clone()));

        let client = proxy::build_shared_client();
        let health = HealthChecker::spawn(&registry, &settings.health);

        let service = GatewayService::new(
            &settings,
            table,
            registry,
            pool.clone(),
            Arc::clone(&cache),
            client,
        );

        Ok(Self {
            service,
            pool,
            health: Mutex::new(Some(health)),
            stopped: AtomicBool::new(false),
        })
    }

    /// A cheap clone of the request service for each actix worker.
    pub fn service(&self) -> GatewayService {
        self.service.clone()
    }

    /// The script pool handle, present when scripting is enabled.
    pub fn script_pool(&self) -> Option<Arc<ScriptPool>> {
        self.pool.clone()
    }

    /// Invalidates the script cache and rescans the directory; returns
    /// the number of script files present.
    pub fn reload_scripts(&self) -> usize {
        self.service.script_cache().reload()
    }

    /// Stops background work: cancels health workers and waits for them,
    /// then closes the script pool. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let checker = self
            .health
            .lock()
            .expect("gateway health lock poisoned")
            .take();
        if let Some(checker) = checker {
            checker.shutdown().await;
        }

        if let Some(pool) = &self.pool {
            pool.close();
        }

        info!("component=gateway event=stopped");
    }
}

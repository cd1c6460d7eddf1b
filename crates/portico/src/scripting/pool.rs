//! The script interpreter pool.
//!
//! A bounded set of pre-initialized rhai engines checked out per request.
//! Engines are created on demand up to `pool_size`, then callers block on
//! the semaphore bounded by the request deadline; a timed-out waiter maps
//! to a 503. Engines are single-threaded for the duration of one request
//! and never execute two requests concurrently.
//!
//! Script execution is CPU-bound and synchronous, so chains run on the
//! actix blocking pool (`web::block`). The closure owns the checked-out
//! engine and returns or discards it itself; cancelling the awaiting
//! future can therefore never leak an engine or a permit.

use crate::models::error::GatewayError;
use crate::models::settings::ScriptingSettings;
use crate::scripting::bridge::{
    self, Chain, ChainOutcome, ChainTerminal, RequestSnapshot, ScriptRequest, ScriptResponse,
};
use crate::scripting::compiler::ScriptCache;
use actix_web::web;
use log::{debug, warn};
use rhai::module_resolvers::{FileModuleResolver, ModuleResolversCollection};
use rhai::{Dynamic, Engine, EvalAltResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

/// Call-stack depth granted to scripts; conservative on purpose.
const MAX_CALL_LEVELS: usize = 100;
/// Upper bounds on script-built values, proportional to the call budget.
const MAX_STRING_SIZE: usize = 1024 * 1024;
const MAX_ARRAY_SIZE: usize = 16 * 1024;
const MAX_MAP_SIZE: usize = 16 * 1024;
/// How often the progress hook re-checks the deadline, in operations.
const DEADLINE_CHECK_MASK: u64 = 0x3FF;

/// Deadline slot read by the engine's progress hook.
///
/// Set at check-out for the current request, cleared at check-in. The
/// hook aborts execution once the deadline passes, which is what bounds a
/// runaway script running on a blocking thread.
#[derive(Default)]
struct DeadlineSlot(Mutex<Option<Instant>>);

/// One pooled interpreter: the engine plus its deadline slot.
pub struct ScriptEngine {
    engine: Engine,
    deadline: Arc<DeadlineSlot>,
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine").finish_non_exhaustive()
    }
}

impl ScriptEngine {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Mutable access for startup-time registration (the registrar
    /// surface installs before any script runs).
    pub(crate) fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    fn set_deadline(&self, deadline: Instant) {
        *self.deadline.0.lock().expect("deadline slot poisoned") = Some(deadline);
    }

    fn clear_deadline(&self) {
        *self.deadline.0.lock().expect("deadline slot poisoned") = None;
    }
}

/// Builds a fresh interpreter with the bridge registered, module search
/// paths configured, and conservative execution limits.
pub(crate) fn build_engine(settings: &ScriptingSettings) -> ScriptEngine {
    let mut engine = Engine::new();

    engine.set_max_call_levels(MAX_CALL_LEVELS);
    engine.set_max_string_size(MAX_STRING_SIZE);
    engine.set_max_array_size(MAX_ARRAY_SIZE);
    engine.set_max_map_size(MAX_MAP_SIZE);

    let mut resolvers = ModuleResolversCollection::new();
    resolvers.push(FileModuleResolver::new_with_path(&settings.scripts_dir));
    for path in &settings.module_paths {
        resolvers.push(FileModuleResolver::new_with_path(path));
    }
    engine.set_module_resolver(resolvers);

    bridge::register_bridge(&mut engine);

    let deadline = Arc::new(DeadlineSlot::default());
    let slot = Arc::clone(&deadline);
    engine.on_progress(move |ops| {
        if ops & DEADLINE_CHECK_MASK != 0 {
            return None;
        }
        let expired = slot
            .0
            .lock()
            .ok()
            .and_then(|d| *d)
            .is_some_and(|d| Instant::now() >= d);
        if expired {
            Some(Dynamic::from("deadline exceeded"))
        } else {
            None
        }
    });

    ScriptEngine { engine, deadline }
}

/// Pool statistics surfaced at `/debug/script-pool`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub created: usize,
    pub available: usize,
    pub in_use: usize,
    pub pool_size: usize,
}

/// Bounded pool of script interpreters.
pub struct ScriptPool {
    settings: ScriptingSettings,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<ScriptEngine>>,
    created: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptPool {
    pub fn new(settings: ScriptingSettings) -> Arc<Self> {
        let pool_size = settings.pool_size.max(1);
        Arc::new(Self {
            settings,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            idle: Mutex::new(Vec::with_capacity(pool_size)),
            created: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn stats(&self) -> PoolStats {
        let created = self.created.load(Ordering::Relaxed);
        let available = self.idle.lock().expect("pool idle list poisoned").len();
        PoolStats {
            created,
            available,
            in_use: created.saturating_sub(available),
            pool_size: self.settings.pool_size.max(1),
        }
    }

    /// Checks out an interpreter, waiting at most until `deadline`.
    ///
    /// Prefers an idle engine, creates a new one while under `pool_size`,
    /// otherwise blocks on the semaphore. A waiter whose deadline passes
    /// (including one that arrives with an already-expired deadline) gets
    /// [`GatewayError::PoolExhausted`].
    pub async fn acquire(
        self: &Arc<Self>,
        deadline: Instant,
    ) -> Result<PooledEngine, GatewayError> {
        let wait = deadline.saturating_duration_since(Instant::now());
        let permit = match timeout(wait, Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                // Semaphore closed: the pool is shutting down.
                return Err(GatewayError::PoolExhausted);
            }
            Err(_) => {
                warn!(
                    "component=script event=script_pool_exhausted pool_size={}",
                    self.settings.pool_size
                );
                return Err(GatewayError::PoolExhausted);
            }
        };

        let engine = {
            let mut idle = self.idle.lock().expect("pool idle list poisoned");
            idle.pop()
        };
        let engine = match engine {
            Some(engine) => engine,
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "component=script event=interpreter_created total={}",
                    self.created.load(Ordering::Relaxed)
                );
                build_engine(&self.settings)
            }
        };

        Ok(PooledEngine {
            engine: Some(engine),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Executes a middleware chain plus terminal inside one checked-out
    /// interpreter on the blocking pool.
    ///
    /// The ASTs of every referenced script are combined so the chain's
    /// functions can call through to each other; top-level statements run
    /// before the first function call, which is where scripts register
    /// their globals.
    pub async fn run_chain(
        self: &Arc<Self>,
        cache: &Arc<ScriptCache>,
        middleware: Vec<String>,
        terminal: ChainTerminal,
        snapshot: RequestSnapshot,
        deadline: Instant,
    ) -> Result<ChainOutcome, GatewayError> {
        let pooled = self.acquire(deadline).await?;

        // The script name errors are attributed to: the handler when there
        // is one, otherwise the outermost middleware.
        let primary = match &terminal {
            ChainTerminal::Handler(name) => name.clone(),
            ChainTerminal::Mark => middleware.first().cloned().unwrap_or_default(),
        };

        let mut names = middleware.clone();
        if let ChainTerminal::Handler(name) = &terminal {
            names.push(name.clone());
        }

        let mut compiled = Vec::with_capacity(names.len());
        for name in &names {
            compiled.push(cache.load(pooled.engine(), name)?);
        }

        let outcome = web::block(move || {
            let mut iter = compiled.into_iter();
            let mut ast = match iter.next() {
                Some(first) => first.ast.clone(),
                None => rhai::AST::empty(),
            };
            for entry in iter {
                ast.combine(entry.ast.clone());
            }

            pooled.set_deadline(deadline);

            let req = ScriptRequest::new(snapshot);
            let res = ScriptResponse::new();
            let chain = Chain::new(middleware, terminal, req, res);
            let result = chain.run(pooled.engine(), &ast);

            match result {
                Ok(outcome) => {
                    pooled.check_in();
                    Ok(outcome)
                }
                Err(err) => {
                    // A failed interpreter is discarded, never reused.
                    let mapped = classify_eval_error(&primary, err);
                    pooled.discard();
                    Err(mapped)
                }
            }
        })
        .await
        .map_err(|_| GatewayError::ScriptRuntime {
            name: primary_owned_fallback(),
            message: "blocking execution was cancelled".to_string(),
        })??;

        Ok(outcome)
    }

    /// Closes the pool: wakes waiters with an error and drops idle
    /// engines. In-flight engines are dropped at check-in.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.semaphore.close();
        let mut idle = self.idle.lock().expect("pool idle list poisoned");
        let dropped = idle.len();
        self.created.fetch_sub(dropped, Ordering::Relaxed);
        idle.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn primary_owned_fallback() -> String {
    "chain".to_string()
}

/// Maps a rhai evaluation error onto the gateway's error kinds.
fn classify_eval_error(name: &str, err: Box<EvalAltResult>) -> GatewayError {
    match *err {
        EvalAltResult::ErrorTerminated(..) => GatewayError::ScriptTimeout {
            name: name.to_string(),
        },
        EvalAltResult::ErrorFunctionNotFound(ref signature, _) => GatewayError::ScriptRuntime {
            name: name.to_string(),
            message: format!("function not found: {}", signature),
        },
        ref other => GatewayError::ScriptRuntime {
            name: name.to_string(),
            message: other.to_string(),
        },
    }
}

/// A checked-out interpreter.
///
/// Dropping the guard returns the engine to the pool; a drop during panic
/// unwinding (or after [`PooledEngine::discard`]) removes it instead, and
/// the permit frees either way.
pub struct PooledEngine {
    engine: Option<ScriptEngine>,
    pool: Arc<ScriptPool>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledEngine").finish_non_exhaustive()
    }
}

impl PooledEngine {
    pub fn engine(&self) -> &Engine {
        self.engine
            .as_ref()
            .expect("engine present until drop")
            .engine()
    }

    fn set_deadline(&self, deadline: Instant) {
        if let Some(engine) = &self.engine {
            engine.set_deadline(deadline);
        }
    }

    /// Returns the engine to the idle list for reuse.
    fn check_in(mut self) {
        if let Some(engine) = self.engine.take() {
            engine.clear_deadline();
            if self.pool.is_closed() {
                self.pool.created.fetch_sub(1, Ordering::Relaxed);
            } else {
                self.pool
                    .idle
                    .lock()
                    .expect("pool idle list poisoned")
                    .push(engine);
            }
        }
    }

    /// Drops the engine and shrinks the created count; used after script
    /// failures and timeouts.
    fn discard(mut self) {
        if self.engine.take().is_some() {
            self.pool.created.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Drop for PooledEngine {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            if std::thread::panicking() || self.pool.is_closed() {
                self.pool.created.fetch_sub(1, Ordering::Relaxed);
            } else {
                engine.clear_deadline();
                self.pool
                    .idle
                    .lock()
                    .expect("pool idle list poisoned")
                    .push(engine);
            }
        }
    }
}

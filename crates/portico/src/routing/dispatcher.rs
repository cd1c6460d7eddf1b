//! The request dispatcher.
//!
//! The gateway's root handler, registered as the actix `default_service`.
//! Runs the global middleware pipeline in fixed order — request-id,
//! real-ip, access logging, recovery, timeout, throttle — then resolves
//! the route and executes the tenant chain: script middleware, then a
//! script handler or the reverse proxy. Body size limiting, compression,
//! and path normalization sit at the actix `App` layer (see the gateway
//! binary).

use crate::models::error::GatewayError;
use crate::models::settings::{MiddlewareSettings, Settings};
use crate::proxy::backend::BackendRegistry;
use crate::proxy::forwarder;
use crate::routing::composer::{HandlerKind, RouteMatch, RouterTable};
use crate::scripting::bridge::{ChainOutcome, ChainTerminal, RequestSnapshot};
use crate::scripting::compiler::ScriptCache;
use crate::scripting::pool::ScriptPool;

use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::FutureExt;
use log::{error, info, warn};
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Everything a request needs, cloned cheaply into each actix worker.
#[derive(Clone)]
pub struct GatewayService {
    table: Arc<RouterTable>,
    registry: Arc<BackendRegistry>,
    pool: Option<Arc<ScriptPool>>,
    cache: Arc<ScriptCache>,
    client: reqwest::Client,
    throttle: Option<Arc<Semaphore>>,
    flags: MiddlewareSettings,
    max_body_bytes: usize,
}

impl GatewayService {
    pub fn new(
        settings: &Settings,
        table: Arc<RouterTable>,
        registry: Arc<BackendRegistry>,
        pool: Option<Arc<ScriptPool>>,
        cache: Arc<ScriptCache>,
        client: reqwest::Client,
    ) -> Self {
        let throttle = match settings.middleware.max_concurrent {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        Self {
            table,
            registry,
            pool,
            cache,
            client,
            throttle,
            flags: settings.middleware.clone(),
            max_body_bytes: settings.limits.max_body_bytes,
        }
    }

    pub fn pool(&self) -> Option<&Arc<ScriptPool>> {
        self.pool.as_ref()
    }

    pub fn script_cache(&self) -> &Arc<ScriptCache> {
        &self.cache
    }

    pub fn route_count(&self) -> usize {
        self.table.len()
    }

    /// The root handler: global middleware pipeline around the matched
    /// route.
    pub async fn dispatch(&self, req: HttpRequest, body: web::Bytes) -> HttpResponse {
        let started = Instant::now();
        let request_id = self.request_id(&req);
        let client_ip = self.client_ip(&req);
        let deadline = started + Duration::from_secs(self.flags.timeout_seconds);

        // Concurrency throttle: block for a slot, bounded by the deadline.
        let _permit = match &self.throttle {
            Some(semaphore) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(wait, Arc::clone(semaphore).acquire_owned()).await {
                    Ok(Ok(permit)) => Some(permit),
                    _ => {
                        warn!(
                            "component=gateway event=throttle_rejected request_id={}",
                            request_id
                        );
                        let response = HttpResponse::ServiceUnavailable()
                            .insert_header(("Retry-After", "1"))
                            .json(json!({
                                "error": "too many concurrent requests",
                                "type": "throttled",
                                "request_id": request_id,
                            }));
                        return self.finish(&req, response, &request_id, &client_ip, started);
                    }
                }
            }
            None => None,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let work = tokio::time::timeout(
            remaining,
            self.handle(&req, &body, &request_id, deadline),
        );

        let response = if self.flags.recovery {
            match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(Ok(response))) => response,
                Ok(Ok(Err(err))) => self.render_error(err, &request_id),
                Ok(Err(_elapsed)) => Self::timeout_response(&request_id),
                Err(_panic) => {
                    error!(
                        "component=gateway event=handler_panic request_id={} path={}",
                        request_id,
                        req.path()
                    );
                    HttpResponse::InternalServerError().json(json!({
                        "error": "internal server error",
                        "type": "panic",
                        "request_id": request_id,
                    }))
                }
            }
        } else {
            match work.await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => self.render_error(err, &request_id),
                Err(_elapsed) => Self::timeout_response(&request_id),
            }
        };

        self.finish(&req, response, &request_id, &client_ip, started)
    }

    /// Route resolution plus tenant chain execution.
    async fn handle(
        &self,
        req: &HttpRequest,
        body: &web::Bytes,
        request_id: &str,
        deadline: Instant,
    ) -> Result<HttpResponse, GatewayError> {
        match self.table.lookup(req.method().as_str(), req.path()) {
            RouteMatch::Found { target, params } => match &target.handler {
                HandlerKind::Proxy => {
                    self.handle_proxy(
                        &target.tenant,
                        target.middleware.clone(),
                        target.strip_prefix.clone(),
                        req,
                        body,
                        params,
                        request_id,
                        deadline,
                    )
                    .await
                }
                HandlerKind::Script(name) => {
                    let outcome = self
                        .run_scripts(
                            target.middleware.clone(),
                            ChainTerminal::Handler(name.clone()),
                            req,
                            body,
                            params,
                            deadline,
                        )
                        .await?;
                    match outcome {
                        ChainOutcome::Response(buffer) | ChainOutcome::Proceed(buffer) => {
                            Ok(buffer.into_response())
                        }
                    }
                }
            },
            RouteMatch::MethodNotAllowed => {
                self.error_handler_response(req, body, deadline, true).await
            }
            RouteMatch::NotFound => {
                self.error_handler_response(req, body, deadline, false).await
            }
        }
    }

    /// Proxy route: optional script middleware chain, then backend
    /// selection and forwarding.
    #[allow(clippy::too_many_arguments)]
    async fn handle_proxy(
        &self,
        tenant: &str,
        middleware: Vec<String>,
        strip_prefix: Option<String>,
        req: &HttpRequest,
        body: &web::Bytes,
        params: Vec<(String, String)>,
        request_id: &str,
        deadline: Instant,
    ) -> Result<HttpResponse, GatewayError> {
        let mut header_overrides = Vec::new();

        if !middleware.is_empty() {
            let outcome = self
                .run_scripts(middleware, ChainTerminal::Mark, req, body, params, deadline)
                .await?;
            match outcome {
                // A middleware short-circuited: its buffered response is
                // the response.
                ChainOutcome::Response(buffer) => return Ok(buffer.into_response()),
                ChainOutcome::Proceed(buffer) => header_overrides = buffer.headers,
            }
        }

        let pool = self
            .registry
            .pool(tenant)
            .ok_or_else(|| GatewayError::CircuitOpen {
                tenant: tenant.to_string(),
            })?;
        let backend = pool.select().ok_or_else(|| GatewayError::CircuitOpen {
            tenant: tenant.to_string(),
        })?;

        let mut response = forwarder::forward(
            &self.client,
            &backend,
            req,
            body,
            strip_prefix.as_deref(),
            deadline,
            request_id,
        )
        .await?;

        // Headers set by middleware around next.call() override the
        // proxied response's.
        for (name, value) in header_overrides {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }

        Ok(response)
    }

    async fn run_scripts(
        &self,
        middleware: Vec<String>,
        terminal: ChainTerminal,
        req: &HttpRequest,
        body: &web::Bytes,
        params: Vec<(String, String)>,
        deadline: Instant,
    ) -> Result<ChainOutcome, GatewayError> {
        let pool = self.pool.as_ref().ok_or_else(|| {
            let name = match &terminal {
                ChainTerminal::Handler(name) => name.clone(),
                ChainTerminal::Mark => middleware.first().cloned().unwrap_or_default(),
            };
            GatewayError::ScriptLoad {
                name,
                message: "scripting is disabled".to_string(),
            }
        })?;

        let snapshot = RequestSnapshot::from_http(req, body, params, self.max_body_bytes);
        pool.run_chain(&self.cache, middleware, terminal, snapshot, deadline)
            .await
    }

    /// Renders 404/405, preferring the owning tenant's custom script
    /// handler when one is configured and works.
    async fn error_handler_response(
        &self,
        req: &HttpRequest,
        body: &web::Bytes,
        deadline: Instant,
        method_not_allowed: bool,
    ) -> Result<HttpResponse, GatewayError> {
        let custom = self.table.error_handlers_for(req.path()).and_then(|h| {
            if method_not_allowed {
                h.method_not_allowed.clone()
            } else {
                h.not_found.clone()
            }
        });

        if let (Some(handler), Some(_)) = (custom, &self.pool) {
            match self
                .run_scripts(
                    Vec::new(),
                    ChainTerminal::Handler(handler.clone()),
                    req,
                    body,
                    Vec::new(),
                    deadline,
                )
                .await
            {
                Ok(ChainOutcome::Response(buffer)) | Ok(ChainOutcome::Proceed(buffer)) => {
                    return Ok(buffer.into_response());
                }
                Err(err) => {
                    warn!(
                        "component=gateway event=error_handler_failed handler={} error={:?}",
                        handler,
                        err.to_string()
                    );
                }
            }
        }

        if method_not_allowed {
            Err(GatewayError::MethodNotAllowed {
                method: req.method().to_string(),
                path: req.path().to_string(),
            })
        } else {
            Err(GatewayError::RouteNotFound {
                path: req.path().to_string(),
            })
        }
    }

    /// Converts a gateway error into its response, emitting the
    /// script-failure log events the error carries.
    fn render_error(&self, err: GatewayError, request_id: &str) -> HttpResponse {
        match &err {
            GatewayError::ScriptRuntime { name, message } => {
                error!(
                    "component=script event=script_handler_error request_id={} script={} error={:?}",
                    request_id, name, message
                );
            }
            GatewayError::ScriptTimeout { name } => {
                error!(
                    "component=script event=script_handler_error request_id={} script={} error=\"deadline exceeded\"",
                    request_id, name
                );
            }
            GatewayError::ScriptLoad { name, message } => {
                error!(
                    "component=script event=script_load_error request_id={} script={} error={:?}",
                    request_id, name, message
                );
            }
            _ => {}
        }
        err.to_response(request_id)
    }

    fn timeout_response(request_id: &str) -> HttpResponse {
        HttpResponse::GatewayTimeout().json(json!({
            "error": "request timed out",
            "type": "timeout",
            "request_id": request_id,
        }))
    }

    /// Request-id middleware: reuse the inbound header, generate when
    /// absent.
    fn request_id(&self, req: &HttpRequest) -> String {
        req.headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Real-ip middleware: first hop of the forwarded chain when enabled,
    /// otherwise the direct peer.
    fn client_ip(&self, req: &HttpRequest) -> String {
        if self.flags.real_ip {
            if let Some(chain) = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                if let Some(first) = chain.split(',').next().map(str::trim) {
                    if !first.is_empty() {
                        return first.to_string();
                    }
                }
            }
        }
        req.peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Response postlude: echo the request id and emit the access log
    /// line.
    fn finish(
        &self,
        req: &HttpRequest,
        mut response: HttpResponse,
        request_id: &str,
        client_ip: &str,
        started: Instant,
    ) -> HttpResponse {
        if self.flags.request_id {
            if let Ok(value) = HeaderValue::from_str(request_id) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("x-request-id"), value);
            }
        }

        if self.flags.logging {
            info!(
                "component=gateway event=request request_id={} method={} path={} status={} client_ip={} duration_ms={}",
                request_id,
                req.method(),
                req.path(),
                response.status().as_u16(),
                client_ip,
                started.elapsed().as_millis()
            );
        }

        response
    }
}

/// The actix handler bound as `default_service`.
pub async fn dispatch(
    req: HttpRequest,
    body: web::Bytes,
    service: web::Data<GatewayService>,
) -> HttpResponse {
    service.dispatch(req, body).await
}

use actix_web::error::ResponseError;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde_json::json;

/// Error kinds produced by the gateway core.
///
/// Each variant maps to one disposition: `Startup` aborts `Gateway::start`,
/// every other variant renders as an HTTP error response with a JSON body
/// of `{error, type, request_id}` via [`GatewayError::to_response`].
/// Panics are not modelled here; the recovery middleware turns them into
/// plain 500s.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Invalid configuration, duplicate route, or unknown backend
    /// reference discovered while composing the router.
    #[error("invalid configuration: {0}")]
    Startup(String),

    /// No route matched the request path.
    #[error("no route matches path: {path}")]
    RouteNotFound { path: String },

    /// The path matched but the method is not bound.
    #[error("method {method} not allowed for {path}")]
    MethodNotAllowed { method: String, path: String },

    /// Script file missing, unreadable, or failed to compile.
    #[error("script '{name}' failed to load: {message}")]
    ScriptLoad { name: String, message: String },

    /// Uncaught error inside a handler, middleware, or init script.
    #[error("script '{name}' failed: {message}")]
    ScriptRuntime { name: String, message: String },

    /// Script execution exceeded the request deadline.
    #[error("script '{name}' exceeded the request deadline")]
    ScriptTimeout { name: String },

    /// No interpreter could be checked out before the request deadline.
    #[error("script interpreter pool exhausted")]
    PoolExhausted,

    /// TCP/TLS/timeout failure talking to a backend.
    #[error("upstream request to {url} failed: {message}")]
    UpstreamTransport { url: String, message: String },

    /// The selection algorithm found no returnable backend.
    #[error("no available backend for tenant '{tenant}'")]
    CircuitOpen { tenant: String },

    /// Request body exceeded `limits.max_body_bytes` on a script read and
    /// the script did not catch it.
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

impl GatewayError {
    /// Renders the error as its HTTP response, stamping the request id
    /// into the JSON body. The dispatcher uses this for every error it
    /// surfaces so clients can correlate bodies with log lines.
    pub fn to_response(&self, request_id: &str) -> HttpResponse {
        self.render(json!(request_id))
    }

    fn render(&self, request_id: serde_json::Value) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());

        // Hint throttled clients to back off before retrying.
        if matches!(self, GatewayError::PoolExhausted) {
            builder.insert_header(("Retry-After", "1"));
        }

        builder.json(json!({
            "error": self.to_string(),
            "type": self.kind(),
            "request_id": request_id,
        }))
    }

    /// Short machine-readable tag used in JSON error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Startup(_) => "startup",
            GatewayError::RouteNotFound { .. } => "not_found",
            GatewayError::MethodNotAllowed { .. } => "method_not_allowed",
            GatewayError::ScriptLoad { .. } => "script_load",
            GatewayError::ScriptRuntime { .. } => "script_runtime",
            GatewayError::ScriptTimeout { .. } => "script_timeout",
            GatewayError::PoolExhausted => "pool_exhausted",
            GatewayError::UpstreamTransport { .. } => "upstream",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::BodyTooLarge { .. } => "body_too_large",
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Startup(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::ScriptLoad { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ScriptRuntime { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ScriptTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTransport { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::CircuitOpen { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::BodyTooLarge { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Rendered outside a request context; the dispatcher path always
        // goes through `to_response` with the real id.
        self.render(serde_json::Value::Null)
    }
}

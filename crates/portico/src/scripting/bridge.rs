//! The HTTP ↔ script bridge.
//!
//! Scripts never touch actix types. A request is snapshotted into an
//! immutable [`RequestSnapshot`] exposed as the script `Request` value;
//! the script `Response` value writes into a [`ResponseBuffer`] the
//! dispatcher flushes after the handler returns. Buffering makes call
//! order forgiving: `status` and `header` calls are honored no matter
//! where they happen relative to `write`.
//!
//! Script middleware receive a third `next` value; `next.call()` runs the
//! rest of the chain inside the same engine execution. Not calling it
//! short-circuits the chain with whatever was written so far.

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use log::info;
use once_cell::sync::OnceCell;
use rhai::{Dynamic, Engine, EvalAltResult, Map, NativeCallContext, Position};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Immutable view of one inbound request, shared by every bridge value
/// created for it.
#[derive(Debug, Default)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub path: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub max_body_bytes: usize,
}

impl RequestSnapshot {
    /// Snapshots an actix request plus the route's extracted path
    /// parameters.
    pub fn from_http(
        req: &HttpRequest,
        body: &web::Bytes,
        params: Vec<(String, String)>,
        max_body_bytes: usize,
    ) -> Self {
        let connection_info = req.connection_info();
        let host = connection_info.host().to_string();
        let scheme = connection_info.scheme().to_string();
        drop(connection_info);

        let url = format!("{}://{}{}", scheme, host, req.uri());

        let headers = req
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();

        let query = match reqwest::Url::parse(&url) {
            Ok(parsed) => parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            Err(_) => Vec::new(),
        };

        Self {
            method: req.method().as_str().to_string(),
            url,
            path: req.path().to_string(),
            host,
            headers,
            params,
            query,
            body: body.to_vec(),
            max_body_bytes,
        }
    }
}

/// The script-visible request value.
#[derive(Clone)]
pub struct ScriptRequest {
    inner: Arc<RequestSnapshot>,
    body_text: Arc<OnceCell<String>>,
}

impl ScriptRequest {
    pub fn new(snapshot: RequestSnapshot) -> Self {
        Self {
            inner: Arc::new(snapshot),
            body_text: Arc::new(OnceCell::new()),
        }
    }

    fn header(&self, name: &str) -> Dynamic {
        self.inner
            .headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| Dynamic::from(v.clone()))
            .unwrap_or(Dynamic::UNIT)
    }

    /// Body as a string, cached on first call. Raises a catchable script
    /// error when the body exceeds the configured limit; bodies exactly at
    /// the limit succeed.
    fn body(&self) -> Result<String, Box<EvalAltResult>> {
        if self.inner.body.len() > self.inner.max_body_bytes {
            return Err(Box::new(EvalAltResult::ErrorRuntime(
                Dynamic::from(format!(
                    "request body exceeds {} bytes",
                    self.inner.max_body_bytes
                )),
                Position::NONE,
            )));
        }
        let text = self
            .body_text
            .get_or_init(|| String::from_utf8_lossy(&self.inner.body).into_owned());
        Ok(text.clone())
    }

    fn pairs_to_map(pairs: &[(String, String)]) -> Map {
        // Later duplicates win, matching the documented header semantics.
        let mut map = Map::new();
        for (k, v) in pairs {
            map.insert(k.as_str().into(), Dynamic::from(v.clone()));
        }
        map
    }
}

/// Buffered response state filled in by scripts.
#[derive(Debug, Clone, Default)]
pub struct ResponseBuffer {
    /// 0 means "never set"; flushes as 200.
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// True once `write`/`json` ran; distinguishes a deliberate empty
    /// response from an untouched buffer.
    pub wrote: bool,
}

impl ResponseBuffer {
    /// Flushes the buffer into an actix response.
    pub fn into_response(self) -> HttpResponse {
        let status = if self.status == 0 { 200 } else { self.status };
        let mut builder =
            HttpResponse::build(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
        for (name, value) in &self.headers {
            builder.insert_header((name.as_str(), value.as_str()));
        }
        builder.body(self.body)
    }
}

/// The script-visible response value.
#[derive(Clone, Default)]
pub struct ScriptResponse {
    inner: Arc<Mutex<ResponseBuffer>>,
}

impl ScriptResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clones the buffered state out after the handler returns.
    pub fn take_buffer(&self) -> ResponseBuffer {
        self.inner.lock().expect("response buffer poisoned").clone()
    }

    fn write(&self, text: &str) {
        let mut buf = self.inner.lock().expect("response buffer poisoned");
        buf.wrote = true;
        buf.body.extend_from_slice(text.as_bytes());
    }

    fn set_header(&self, name: &str, value: &str) {
        let mut buf = self.inner.lock().expect("response buffer poisoned");
        if let Some(existing) = buf
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            existing.1 = value.to_string();
        } else {
            buf.headers.push((name.to_string(), value.to_string()));
        }
    }

    fn set_status(&self, code: i64) {
        let mut buf = self.inner.lock().expect("response buffer poisoned");
        buf.status = code.clamp(100, 999) as u16;
    }

    fn json(&self, text: &str) {
        self.set_header("Content-Type", "application/json");
        self.write(text);
    }
}

/// What runs when the middleware chain reaches its end.
#[derive(Debug, Clone)]
pub enum ChainTerminal {
    /// Invoke a script handler function.
    Handler(String),
    /// Mark completion only; the caller proxies afterwards.
    Mark,
}

/// Result of executing a chain inside an interpreter.
#[derive(Debug)]
pub enum ChainOutcome {
    /// The chain produced the response (handler ran, or a middleware
    /// short-circuited).
    Response(ResponseBuffer),
    /// The chain completed through to the proxy marker; the buffer holds
    /// header overrides middleware applied around `next.call()`.
    Proceed(ResponseBuffer),
}

struct ChainState {
    names: Vec<String>,
    terminal: ChainTerminal,
    req: ScriptRequest,
    res: ScriptResponse,
    completed: AtomicBool,
}

/// The `next` continuation handed to script middleware.
#[derive(Clone)]
pub struct Next {
    state: Arc<ChainState>,
    pos: usize,
}

impl Next {
    fn advance(&self, ctx: &NativeCallContext) -> Result<(), Box<EvalAltResult>> {
        if let Some(name) = self.state.names.get(self.pos) {
            let next = Next {
                state: Arc::clone(&self.state),
                pos: self.pos + 1,
            };
            ctx.call_fn::<Dynamic>(
                name,
                (self.state.req.clone(), self.state.res.clone(), next),
            )?;
            return Ok(());
        }

        match &self.state.terminal {
            ChainTerminal::Handler(name) => {
                ctx.call_fn::<Dynamic>(
                    name,
                    (self.state.req.clone(), self.state.res.clone()),
                )?;
            }
            ChainTerminal::Mark => {}
        }
        self.state.completed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// A fully wired chain ready to run inside one engine execution.
pub struct Chain {
    state: Arc<ChainState>,
}

impl Chain {
    pub fn new(
        middleware: Vec<String>,
        terminal: ChainTerminal,
        req: ScriptRequest,
        res: ScriptResponse,
    ) -> Self {
        Self {
            state: Arc::new(ChainState {
                names: middleware,
                terminal,
                req,
                res,
                completed: AtomicBool::new(false),
            }),
        }
    }

    /// Runs the chain: the outermost middleware first, or the terminal
    /// directly when there is no middleware.
    pub fn run(
        &self,
        engine: &Engine,
        ast: &rhai::AST,
    ) -> Result<ChainOutcome, Box<EvalAltResult>> {
        let state = &self.state;
        let mut scope = rhai::Scope::new();

        if let Some(first) = state.names.first() {
            let next = Next {
                state: Arc::clone(state),
                pos: 1,
            };
            engine.call_fn::<Dynamic>(
                &mut scope,
                ast,
                first,
                (state.req.clone(), state.res.clone(), next),
            )?;
        } else {
            match &state.terminal {
                ChainTerminal::Handler(name) => {
                    engine.call_fn::<Dynamic>(
                        &mut scope,
                        ast,
                        name,
                        (state.req.clone(), state.res.clone()),
                    )?;
                }
                ChainTerminal::Mark => {}
            }
            state.completed.store(true, Ordering::Relaxed);
        }

        let buffer = state.res.take_buffer();
        let outcome = match state.terminal {
            ChainTerminal::Handler(_) => ChainOutcome::Response(buffer),
            ChainTerminal::Mark => {
                if state.completed.load(Ordering::Relaxed) {
                    ChainOutcome::Proceed(buffer)
                } else {
                    ChainOutcome::Response(buffer)
                }
            }
        };
        Ok(outcome)
    }
}

/// Registers the bridge surface on a fresh engine: the `Request`,
/// `Response`, and `Next` types plus the global `log` function.
pub fn register_bridge(engine: &mut Engine) {
    engine.register_type_with_name::<ScriptRequest>("Request");
    engine.register_get("method", |r: &mut ScriptRequest| r.inner.method.clone());
    engine.register_get("url", |r: &mut ScriptRequest| r.inner.url.clone());
    engine.register_get("path", |r: &mut ScriptRequest| r.inner.path.clone());
    engine.register_get("host", |r: &mut ScriptRequest| r.inner.host.clone());
    engine.register_get("headers", |r: &mut ScriptRequest| {
        ScriptRequest::pairs_to_map(&r.inner.headers)
    });
    engine.register_get("params", |r: &mut ScriptRequest| {
        ScriptRequest::pairs_to_map(&r.inner.params)
    });
    engine.register_get("query", |r: &mut ScriptRequest| {
        ScriptRequest::pairs_to_map(&r.inner.query)
    });
    engine.register_fn("header", |r: &mut ScriptRequest, name: &str| r.header(name));
    engine.register_fn("body", |r: &mut ScriptRequest| r.body());

    engine.register_type_with_name::<ScriptResponse>("Response");
    engine.register_fn("write", |r: &mut ScriptResponse, text: &str| r.write(text));
    engine.register_fn("header", |r: &mut ScriptResponse, name: &str, value: &str| {
        r.set_header(name, value)
    });
    engine.register_fn("status", |r: &mut ScriptResponse, code: i64| {
        r.set_status(code)
    });
    engine.register_fn("json", |r: &mut ScriptResponse, text: &str| r.json(text));

    engine.register_type_with_name::<Next>("Next");
    engine.register_fn(
        "call",
        |ctx: NativeCallContext, next: &mut Next| -> Result<(), Box<EvalAltResult>> {
            let next = next.clone();
            next.advance(&ctx)
        },
    );

    engine.register_fn("log", |message: &str| {
        info!("component=script {}", message);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_body(body: &[u8], max: usize) -> ScriptRequest {
        ScriptRequest::new(RequestSnapshot {
            method: "POST".to_string(),
            body: body.to_vec(),
            max_body_bytes: max,
            ..Default::default()
        })
    }

    #[test]
    fn body_at_limit_succeeds() {
        let req = snapshot_with_body(b"12345", 5);
        assert_eq!(req.body().unwrap(), "12345");
    }

    #[test]
    fn body_over_limit_raises() {
        let req = snapshot_with_body(b"123456", 5);
        let err = req.body().unwrap_err();
        assert!(err.to_string().contains("exceeds 5 bytes"));
    }

    #[test]
    fn header_lookup_is_case_insensitive_last_wins() {
        let req = ScriptRequest::new(RequestSnapshot {
            headers: vec![
                ("X-T".to_string(), "first".to_string()),
                ("x-t".to_string(), "second".to_string()),
            ],
            ..Default::default()
        });
        let value = req.header("X-T");
        assert_eq!(value.into_string().unwrap(), "second");
        assert!(req.header("missing").is_unit());
    }

    #[test]
    fn response_buffer_accumulates_in_order() {
        let res = ScriptResponse::new();
        res.set_status(201);
        res.set_header("X-T", "a");
        res.set_header("x-t", "b");
        res.write("hello");

        let buf = res.take_buffer();
        assert_eq!(buf.status, 201);
        assert_eq!(buf.headers, vec![("X-T".to_string(), "b".to_string())]);
        assert_eq!(buf.body, b"hello");
        assert!(buf.wrote);
    }

    #[test]
    fn json_sets_content_type() {
        let res = ScriptResponse::new();
        res.json(r#"{"ok":true}"#);
        let buf = res.take_buffer();
        assert!(buf
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Type" && v == "application/json"));
        assert_eq!(buf.body, br#"{"ok":true}"#);
    }

    #[test]
    fn untouched_buffer_flushes_as_200_empty() {
        let res = ScriptResponse::new();
        let buf = res.take_buffer();
        assert_eq!(buf.status, 0);
        assert!(!buf.wrote);
        let http = buf.into_response();
        assert_eq!(http.status().as_u16(), 200);
    }
}

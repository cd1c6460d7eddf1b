//! Reverse proxy forwarding over the shared outbound client.
//!
//! Builds the outbound request with the director's rewrite steps, bounds
//! it by the request deadline, observes the response for circuit breaker
//! accounting, and converts the upstream response back into an actix
//! response.

use crate::models::error::GatewayError;
use crate::proxy::backend::Backend;
use crate::proxy::director;

use actix_web::http::{Method as ActixMethod, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse};
use log::{debug, error};
use reqwest::header::{HeaderMap as ReqwestHeaderMap, HeaderName, HeaderValue};
use reqwest::Method as ReqwestMethod;
use std::time::Instant;
use tokio::time::timeout;

/// Hop-by-hop and proxy-managed headers never copied to the outbound
/// request verbatim.
const SKIP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "proxy-connection",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
];

/// Proxies one request to the selected backend.
///
/// `strip` is the mount prefix consumed during routing (the tenant's
/// `path_prefix`), removed from the outbound path before the backend's
/// base path is prepended. The outbound call is bounded by the remaining
/// request deadline.
///
/// Breaker accounting: responses with status >= 500 and transport errors
/// record a failure; anything else records a success. Transport errors
/// (refused, reset, deadline) map to [`GatewayError::UpstreamTransport`]
/// which renders as 502.
pub async fn forward(
    client: &reqwest::Client,
    backend: &Backend,
    req: &HttpRequest,
    body: &web::Bytes,
    strip: Option<&str>,
    deadline: Instant,
    request_id: &str,
) -> Result<HttpResponse, GatewayError> {
    let path = match strip {
        Some(prefix) => director::strip_prefix(req.path(), prefix),
        None => req.path().to_string(),
    };
    let query = match req.query_string() {
        "" => None,
        q => Some(q),
    };
    let target_url = director::build_upstream_url(backend, &path, query);

    let headers = build_outbound_headers(req);

    debug!(
        "component=proxy event=forwarding request_id={} url={}",
        request_id, target_url
    );

    let outbound = client
        .request(convert_method(req.method()), &target_url)
        .headers(headers)
        .body(body.to_vec());

    let remaining = deadline.saturating_duration_since(Instant::now());
    let response = match timeout(remaining, outbound.send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            backend.breaker.record_failure();
            error!(
                "component=proxy event=proxy_error request_id={} url={} error={:?}",
                request_id,
                target_url,
                e.to_string()
            );
            return Err(GatewayError::UpstreamTransport {
                url: target_url,
                message: e.to_string(),
            });
        }
        Err(_) => {
            backend.breaker.record_failure();
            error!(
                "component=proxy event=proxy_error request_id={} url={} error=\"deadline exceeded\"",
                request_id, target_url
            );
            return Err(GatewayError::UpstreamTransport {
                url: target_url,
                message: "deadline exceeded".to_string(),
            });
        }
    };

    let status = response.status().as_u16();
    if status >= 500 {
        backend.breaker.record_failure();
    } else {
        backend.breaker.record_success();
    }

    // Convert the upstream response, passing status, headers, and body
    // through unchanged.
    let mut builder = HttpResponse::build(
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
    );

    for (key, value) in response.headers() {
        if !key.as_str().starts_with("connection") {
            if let Ok(header_value) =
                actix_web::http::header::HeaderValue::from_bytes(value.as_bytes())
            {
                builder.insert_header((key.as_str(), header_value));
            }
        }
    }

    match response.bytes().await {
        Ok(bytes) => Ok(builder.body(bytes)),
        Err(e) => {
            backend.breaker.record_failure();
            Err(GatewayError::UpstreamTransport {
                url: target_url,
                message: e.to_string(),
            })
        }
    }
}

/// Copies request headers for forwarding, dropping hop-by-hop headers and
/// stamping the forwarded trio.
fn build_outbound_headers(req: &HttpRequest) -> ReqwestHeaderMap {
    let original = req.headers();
    let mut headers = ReqwestHeaderMap::with_capacity(original.len() + 3);

    for (key, value) in original {
        let key_str = key.as_str().to_lowercase();
        if SKIP_HEADERS.iter().any(|&skip| key_str == skip) {
            continue;
        }

        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_ref()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    // X-Forwarded-For: append the direct peer to any inbound chain.
    let inbound_chain = header_str(req, "x-forwarded-for");
    let forwarded_for = match req.peer_addr() {
        Some(addr) => Some(director::append_forwarded_for(
            inbound_chain.as_deref(),
            &addr.ip().to_string(),
        )),
        None => inbound_chain,
    };
    if let Some(chain) = forwarded_for {
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert("x-forwarded-for", value);
        }
    }

    // X-Forwarded-Host: the host the client addressed.
    let connection_info = req.connection_info();
    if let Ok(value) = HeaderValue::from_str(connection_info.host()) {
        headers.insert("x-forwarded-host", value);
    }

    // X-Forwarded-Proto: https when TLS terminated here or upstream of us.
    let proto = director::forwarded_proto(
        connection_info.scheme() == "https",
        header_str(req, "x-forwarded-proto").as_deref(),
    );
    headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));

    headers.entry("user-agent").or_insert_with(|| {
        HeaderValue::from_static(concat!("portico/", env!("CARGO_PKG_VERSION")))
    });

    headers
}

fn header_str(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn convert_method(method: &ActixMethod) -> ReqwestMethod {
    match *method {
        ActixMethod::GET => ReqwestMethod::GET,
        ActixMethod::POST => ReqwestMethod::POST,
        ActixMethod::PUT => ReqwestMethod::PUT,
        ActixMethod::DELETE => ReqwestMethod::DELETE,
        ActixMethod::HEAD => ReqwestMethod::HEAD,
        ActixMethod::OPTIONS => ReqwestMethod::OPTIONS,
        ActixMethod::CONNECT => ReqwestMethod::CONNECT,
        ActixMethod::PATCH => ReqwestMethod::PATCH,
        ActixMethod::TRACE => ReqwestMethod::TRACE,
        _ => ReqwestMethod::GET,
    }
}

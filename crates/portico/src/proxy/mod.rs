//! The backend proxy plane.
//!
//! Everything between a matched proxy route and the upstream service:
//! the shared outbound transport, per-tenant backend pools with
//! round-robin selection, circuit breakers, active health checking, and
//! the director/forwarder pair that rewrites and sends the request.

pub mod backend;
pub mod breaker;
pub mod director;
pub mod forwarder;
pub mod health;

use std::time::Duration;

/// Builds the shared outbound HTTP client (C1).
///
/// One transport for every proxied request: pooled connections with a
/// bounded idle set per host, HTTP/2 negotiated via ALPN where the
/// backend supports it, and a connect timeout so dead hosts fail fast.
/// Per-request deadlines are enforced by the caller, not the client.
pub fn build_shared_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(32)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to create HTTP client")
}

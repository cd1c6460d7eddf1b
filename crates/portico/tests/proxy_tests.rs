//! Live proxy tests against minimal local backends: path/query rewriting,
//! forwarded headers, breaker behavior under failing upstreams, transport
//! errors, and health-driven liveness.

mod common;

use actix_web::middleware::NormalizePath;
use actix_web::{test, web, App};
use common::{header_value, http_response, request_line, spawn_backend};
use portico::gateway::Gateway;
use portico::models::settings::Settings;
use portico::proxy::backend::BackendRegistry;
use portico::proxy::breaker::CircuitState;
use portico::proxy::health::HealthChecker;
use portico::routing::dispatcher;
use std::time::Duration;

fn proxy_settings(tenants: serde_json::Value) -> Settings {
    serde_json::from_value(serde_json::json!({
        "version": 1,
        "tenants": tenants,
        "middleware": { "timeout_seconds": 5 },
        "breaker": { "failure_threshold": 2, "cooldown_seconds": 60 }
    }))
    .unwrap()
}

macro_rules! test_app {
    ($service:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($service))
                .wrap(NormalizePath::trim())
                .default_service(web::route().to(dispatcher::dispatch)),
        )
        .await
    };
}

#[actix_web::test]
async fn prefixed_tenant_proxies_with_rewritten_path_and_forwarded_headers() {
    let (addr, log) = spawn_backend(|_, _| http_response(200, "OK", "from-backend")).await;

    let settings = proxy_settings(serde_json::json!([{
        "name": "t1",
        "path_prefix": "/api/",
        "services": [{"name": "s1", "url": format!("http://{addr}/root")}],
        "routes": [{"method": "GET", "pattern": "/users", "backend": "s1"}]
    }]));

    let gateway = Gateway::start(settings).await.unwrap();
    let service = gateway.service();
    let app = test_app!(service);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/users?x=1")
            .peer_addr("9.9.9.9:1234".parse().unwrap())
            .to_request(),
    )
    .await;

    assert_eq!(resp.status(), 200);
    let body = test::read_body(resp).await;
    assert_eq!(&body[..], b"from-backend");

    let heads = log.lock().unwrap();
    assert_eq!(heads.len(), 1);
    let head = &heads[0];
    // Mount prefix stripped, backend base path prepended, query intact.
    assert_eq!(request_line(head), "GET /root/users?x=1 HTTP/1.1");
    // Host rewritten to the backend authority.
    assert_eq!(header_value(head, "host").unwrap(), addr.to_string());
    assert!(header_value(head, "x-forwarded-host").is_some());
    assert_eq!(header_value(head, "x-forwarded-proto").unwrap(), "http");
    assert_eq!(header_value(head, "x-forwarded-for").unwrap(), "9.9.9.9");
}

#[actix_web::test]
async fn backend_query_is_prepended_to_request_query() {
    let (addr, log) = spawn_backend(|_, _| http_response(200, "OK", "ok")).await;

    let settings = proxy_settings(serde_json::json!([{
        "name": "t1",
        "services": [{"name": "s1", "url": format!("http://{addr}/base?env=prod")}],
        "routes": [{"method": "GET", "pattern": "/things", "backend": "s1"}]
    }]));

    let gateway = Gateway::start(settings).await.unwrap();
    let service = gateway.service();
    let app = test_app!(service);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/things?x=1").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let heads = log.lock().unwrap();
    assert_eq!(request_line(&heads[0]), "GET /base/things?env=prod&x=1 HTTP/1.1");
}

#[actix_web::test]
async fn upstream_5xx_passes_through_and_opens_breaker_after_threshold() {
    let (good_addr, good_log) = spawn_backend(|_, _| http_response(200, "OK", "good")).await;
    let (bad_addr, bad_log) =
        spawn_backend(|_, _| http_response(500, "Internal Server Error", "bad")).await;

    let settings = proxy_settings(serde_json::json!([{
        "name": "t1",
        "services": [
            {"name": "s1", "url": format!("http://{good_addr}")},
            {"name": "s2", "url": format!("http://{bad_addr}")}
        ],
        "routes": [{"method": "GET", "pattern": "/x", "backend": "s1"}]
    }]));

    let gateway = Gateway::start(settings).await.unwrap();
    let service = gateway.service();
    let app = test_app!(service);

    let mut statuses = Vec::new();
    for _ in 0..8 {
        let resp = test::call_service(&app, test::TestRequest::get().uri("/x").to_request()).await;
        statuses.push(resp.status().as_u16());
    }

    // Round-robin sent the 2nd and 4th request to the failing backend and
    // its 500s passed through unchanged; after the threshold its breaker
    // opened and every later request went to the good backend.
    assert_eq!(statuses.iter().filter(|s| **s == 500).count(), 2);
    assert_eq!(bad_log.lock().unwrap().len(), 2);
    assert_eq!(good_log.lock().unwrap().len(), 6);
}

#[actix_web::test]
async fn dead_backend_maps_to_502() {
    // Grab a port nothing listens on.
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let settings = proxy_settings(serde_json::json!([{
        "name": "t1",
        "services": [{"name": "s1", "url": format!("http://{addr}")}],
        "routes": [{"method": "GET", "pattern": "/x", "backend": "s1"}]
    }]));

    let gateway = Gateway::start(settings).await.unwrap();
    let service = gateway.service();
    let app = test_app!(service);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/x").to_request()).await;
    assert_eq!(resp.status(), 502);
}

#[tokio::test]
async fn health_probe_flips_liveness_and_resets_breaker() {
    // First probe sees 503, every later probe 200.
    let (addr, _log) = spawn_backend(|index, _| {
        if index == 0 {
            http_response(503, "Service Unavailable", "down")
        } else {
            http_response(200, "OK", "up")
        }
    })
    .await;

    let settings: Settings = serde_json::from_value(serde_json::json!({
        "version": 1,
        "tenants": [{
            "name": "t1",
            "services": [{
                "name": "s1",
                "url": format!("http://{addr}"),
                "health_path": "/h"
            }],
            "routes": [{"method": "GET", "pattern": "/x", "backend": "s1"}]
        }],
        "health": { "interval_seconds": 1, "timeout_seconds": 2 }
    }))
    .unwrap();

    let registry = BackendRegistry::build(&settings).unwrap();
    let backend = registry.pool("t1").unwrap().backends()[0].clone();

    // Pre-trip the breaker so recovery can prove it resets.
    for _ in 0..5 {
        backend.breaker.record_failure();
    }
    assert_eq!(backend.breaker.state(), CircuitState::Open);

    let checker = HealthChecker::spawn(&registry, &settings.health);

    // The immediate first probe marks the backend down.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!backend.is_alive());

    // The next interval's probe sees 200: alive again, breaker closed.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(backend.is_alive());
    assert_eq!(backend.breaker.state(), CircuitState::Closed);

    checker.shutdown().await;
}

#[tokio::test]
async fn backend_without_health_path_stays_optimistically_alive() {
    let settings: Settings = serde_json::from_value(serde_json::json!({
        "version": 1,
        "tenants": [{
            "name": "t1",
            "services": [{"name": "s1", "url": "http://127.0.0.1:1"}],
            "routes": [{"method": "GET", "pattern": "/x", "backend": "s1"}]
        }]
    }))
    .unwrap();

    let registry = BackendRegistry::build(&settings).unwrap();
    let checker = HealthChecker::spawn(&registry, &settings.health);

    let backend = registry.pool("t1").unwrap().backends()[0].clone();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(backend.is_alive());

    checker.shutdown().await;
}

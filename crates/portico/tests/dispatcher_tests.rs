//! End-to-end dispatcher tests: the composed gateway behind an actix
//! test service, with script handlers on disk.

use actix_web::middleware::NormalizePath;
use actix_web::{test, web, App};
use portico::gateway::Gateway;
use portico::models::settings::Settings;
use portico::routes::health;
use portico::routing::dispatcher::{self, GatewayService};
use std::path::Path;

fn write_script(dir: &Path, name: &str, source: &str) {
    std::fs::write(dir.join(format!("{name}.rhai")), source).unwrap();
}

fn settings_with_scripts(dir: &Path, tenants: serde_json::Value) -> Settings {
    serde_json::from_value(serde_json::json!({
        "version": 1,
        "tenants": tenants,
        "scripting": {
            "enabled": true,
            "scripts_dir": dir.display().to_string(),
            "pool_size": 2
        },
        "middleware": { "timeout_seconds": 5 }
    }))
    .unwrap()
}

async fn started_service(settings: Settings) -> (Gateway, GatewayService) {
    let gateway = Gateway::start(settings).await.expect("gateway must start");
    let service = gateway.service();
    (gateway, service)
}

macro_rules! test_app {
    ($service:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($service))
                .wrap(NormalizePath::trim())
                .configure(health::configure_health)
                .default_service(web::route().to(dispatcher::dispatch)),
        )
        .await
    };
}

#[actix_web::test]
async fn health_endpoint_returns_plain_ok() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_with_scripts(dir.path(), serde_json::json!([]));
    let (_gateway, service) = started_service(settings).await;
    let app = test_app!(service);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), 200);
    let body = test::read_body(resp).await;
    assert_eq!(&body[..], b"OK");
}

#[actix_web::test]
async fn script_handler_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "hello_fn",
        r#"
        fn hello_fn(req, res) {
            res.status(201);
            res.header("X-T", "a");
            res.write("{\"ok\":true}");
        }
        "#,
    );

    let settings = settings_with_scripts(
        dir.path(),
        serde_json::json!([{
            "name": "t1",
            "routes": [{"method": "GET", "pattern": "/hello", "handler": "hello_fn"}]
        }]),
    );
    let (_gateway, service) = started_service(settings).await;
    let app = test_app!(service);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/hello").to_request()).await;
    assert_eq!(resp.status(), 201);
    assert_eq!(resp.headers().get("x-t").unwrap(), "a");
    assert!(resp.headers().contains_key("x-request-id"));
    // The handler set no content type, so none is present.
    assert!(resp.headers().get("content-type").is_none());
    let body = test::read_body(resp).await;
    assert_eq!(&body[..], br#"{"ok":true}"#);
}

#[actix_web::test]
async fn inbound_request_id_is_echoed() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "h", r#"fn h(req, res) { res.write("x") }"#);

    let settings = settings_with_scripts(
        dir.path(),
        serde_json::json!([{
            "name": "t1",
            "routes": [{"method": "GET", "pattern": "/x", "handler": "h"}]
        }]),
    );
    let (_gateway, service) = started_service(settings).await;
    let app = test_app!(service);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/x")
            .insert_header(("X-Request-Id", "req-123"))
            .to_request(),
    )
    .await;
    assert_eq!(resp.headers().get("x-request-id").unwrap(), "req-123");
}

#[actix_web::test]
async fn unknown_path_is_404_with_request_id() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_with_scripts(dir.path(), serde_json::json!([]));
    let (_gateway, service) = started_service(settings).await;
    let app = test_app!(service);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/nope").to_request()).await;
    assert_eq!(resp.status(), 404);
    let header_id = resp
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .expect("error responses carry a request id");

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["type"], "not_found");
    // The body's request id is the same one echoed in the header.
    assert_eq!(body["request_id"], header_id.as_str());
}

#[actix_web::test]
async fn wrong_method_is_405() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "h", r#"fn h(req, res) { res.write("x") }"#);

    let settings = settings_with_scripts(
        dir.path(),
        serde_json::json!([{
            "name": "t1",
            "routes": [{"method": "GET", "pattern": "/only-get", "handler": "h"}]
        }]),
    );
    let (_gateway, service) = started_service(settings).await;
    let app = test_app!(service);

    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri("/only-get").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 405);
}

#[actix_web::test]
async fn custom_not_found_handler_replaces_default() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "miss",
        r#"
        fn miss(req, res) {
            res.status(404);
            res.write("custom miss: " + req.path);
        }
        "#,
    );

    let settings = settings_with_scripts(
        dir.path(),
        serde_json::json!([{
            "name": "t1",
            "path_prefix": "/api",
            "error_handlers": {"not_found": "miss"},
            "routes": [{"method": "GET", "pattern": "/known", "handler": "miss"}]
        }]),
    );
    let (_gateway, service) = started_service(settings).await;
    let app = test_app!(service);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/api/missing").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 404);
    let body = test::read_body(resp).await;
    assert_eq!(&body[..], b"custom miss: /api/missing");
}

#[actix_web::test]
async fn group_and_route_middleware_order_matches_declaration() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "auth",
        r#"fn auth(req, res, next) { res.write("auth>"); next.call(); }"#,
    );
    write_script(
        dir.path(),
        "log_mw",
        r#"fn log_mw(req, res, next) { res.write("log>"); next.call(); }"#,
    );
    write_script(dir.path(), "h", r#"fn h(req, res) { res.write("h") }"#);

    let settings = settings_with_scripts(
        dir.path(),
        serde_json::json!([{
            "name": "t1",
            "route_groups": [{
                "pattern": "/v1",
                "middleware": ["auth"],
                "routes": [{
                    "method": "GET",
                    "pattern": "/x",
                    "middleware": ["log_mw"],
                    "handler": "h"
                }]
            }]
        }]),
    );
    let (_gateway, service) = started_service(settings).await;
    let app = test_app!(service);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/v1/x").to_request()).await;
    let body = test::read_body(resp).await;
    assert_eq!(&body[..], b"auth>log>h");
}

#[actix_web::test]
async fn path_parameters_reach_the_handler() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "show",
        r#"fn show(req, res) { res.write("user " + req.params["id"]) }"#,
    );

    let settings = settings_with_scripts(
        dir.path(),
        serde_json::json!([{
            "name": "t1",
            "routes": [{"method": "GET", "pattern": "/users/{id}", "handler": "show"}]
        }]),
    );
    let (_gateway, service) = started_service(settings).await;
    let app = test_app!(service);

    let resp =
        test::call_service(&app, test::TestRequest::get().uri("/users/42").to_request()).await;
    let body = test::read_body(resp).await;
    assert_eq!(&body[..], b"user 42");
}

#[actix_web::test]
async fn script_error_maps_to_500() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "boom", r#"fn boom(req, res) { throw "nope" }"#);

    let settings = settings_with_scripts(
        dir.path(),
        serde_json::json!([{
            "name": "t1",
            "routes": [{"method": "GET", "pattern": "/boom", "handler": "boom"}]
        }]),
    );
    let (_gateway, service) = started_service(settings).await;
    let app = test_app!(service);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/boom").to_request()).await;
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["type"], "script_runtime");
}

#[actix_web::test]
async fn runaway_script_times_out_as_504() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "spin",
        r#"fn spin(req, res) { let x = 0; loop { x += 1; } }"#,
    );

    let mut settings = settings_with_scripts(
        dir.path(),
        serde_json::json!([{
            "name": "t1",
            "routes": [{"method": "GET", "pattern": "/spin", "handler": "spin"}]
        }]),
    );
    settings.middleware.timeout_seconds = 1;

    let (_gateway, service) = started_service(settings).await;
    let app = test_app!(service);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/spin").to_request()).await;
    assert_eq!(resp.status(), 504);
}

#[actix_web::test]
async fn missing_script_file_maps_to_500_at_first_request() {
    let dir = tempfile::tempdir().unwrap();

    let settings = settings_with_scripts(
        dir.path(),
        serde_json::json!([{
            "name": "t1",
            "routes": [{"method": "GET", "pattern": "/ghost", "handler": "ghost"}]
        }]),
    );
    // Startup succeeds: script names resolve through the runtime, not at
    // composition time.
    let (_gateway, service) = started_service(settings).await;
    let app = test_app!(service);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/ghost").to_request()).await;
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["type"], "script_load");
}

#[actix_web::test]
async fn global_script_registers_routes_before_serving() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "global-routes",
        r#"
        mount("scripted", "/s");
        route("GET", "/hello", "greet");
        "#,
    );
    write_script(dir.path(), "greet", r#"fn greet(req, res) { res.write("hi") }"#);

    let settings = settings_with_scripts(dir.path(), serde_json::json!([]));
    let (_gateway, service) = started_service(settings).await;
    let app = test_app!(service);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/s/hello").to_request()).await;
    assert_eq!(resp.status(), 200);
    let body = test::read_body(resp).await;
    assert_eq!(&body[..], b"hi");
}

#[actix_web::test]
async fn script_pool_stats_endpoint_reports_counters() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "h", r#"fn h(req, res) { res.write("x") }"#);

    let settings = settings_with_scripts(
        dir.path(),
        serde_json::json!([{
            "name": "t1",
            "routes": [{"method": "GET", "pattern": "/x", "handler": "h"}]
        }]),
    );
    let gateway = Gateway::start(settings).await.unwrap();
    let service = gateway.service();
    let pool = gateway.script_pool().unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(service))
            .app_data(web::Data::new(std::sync::Arc::clone(&pool)))
            .wrap(NormalizePath::trim())
            .configure(portico::routes::debug::configure_debug)
            .default_service(web::route().to(dispatcher::dispatch)),
    )
    .await;

    // One script request warms the pool.
    let resp = test::call_service(&app, test::TestRequest::get().uri("/x").to_request()).await;
    assert_eq!(resp.status(), 200);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/debug/script-pool").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let stats: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(stats["pool_size"], 2);
    assert_eq!(stats["created"], 1);
    assert_eq!(stats["available"], 1);
    assert_eq!(stats["in_use"], 0);
}

#[actix_web::test]
async fn startup_fails_on_duplicate_routes() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_with_scripts(
        dir.path(),
        serde_json::json!([{
            "name": "t1",
            "routes": [
                {"method": "GET", "pattern": "/dup", "handler": "a"},
                {"method": "GET", "pattern": "/dup", "handler": "b"}
            ]
        }]),
    );

    assert!(Gateway::start(settings).await.is_err());
}

#[actix_web::test]
async fn stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_with_scripts(dir.path(), serde_json::json!([]));
    let gateway = Gateway::start(settings).await.unwrap();

    gateway.stop().await;
    gateway.stop().await;
}

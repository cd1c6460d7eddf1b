//! Portico Gateway Server
//!
//! Multi-tenant scripted reverse proxy built with Rust and Actix Web.
//!
//! This binary provides the server entry point: logger setup,
//! configuration loading, gateway composition, and the HTTP server with
//! the app-level middleware stack (body limit, compression, path
//! normalization) around the catch-all dispatcher.

use portico::config::settings::load_settings;
use portico::gateway::Gateway;
use portico::logs::logger::configure_logger;
use portico::models::settings::Settings;
use portico::routes::{debug, health};
use portico::routing::dispatcher;

use actix_web::middleware::{Compress, Condition, NormalizePath};
use actix_web::{web, App, HttpServer};
use log::{error, info};
use std::sync::Arc;
use tokio::signal;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize the logger
    configure_logger();

    // Parse configuration
    let settings: Settings = load_settings().expect("Failed to load settings");

    info!(
        "Starting Portico gateway v{} with {} tenants",
        env!("CARGO_PKG_VERSION"),
        settings.tenants.len()
    );

    let compression_enabled = settings.compression.enabled;
    let max_body_bytes = settings.limits.max_body_bytes;
    let scripting_enabled = settings.scripting.enabled;

    // Compose the gateway: validation, startup scripts, router, health
    // workers. Failures here must stop the process before it serves.
    let gateway = match Gateway::start(settings).await {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            error!("Gateway startup failed: {}", e);
            std::process::exit(1);
        }
    };

    let service = gateway.service();
    let script_pool = gateway.script_pool();

    // Get server configuration from environment
    let host = std::env::var("PORTICO_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORTICO_PORT")
        .unwrap_or_else(|_| "5900".to_string())
        .parse::<u16>()
        .unwrap_or(5900);

    info!("Starting server on {}:{}", host, port);

    let server = HttpServer::new(move || {
        let mut app = App::new()
            .app_data(web::Data::new(service.clone()))
            .app_data(web::PayloadConfig::new(max_body_bytes))
            .wrap(Condition::new(compression_enabled, Compress::default()))
            .wrap(NormalizePath::trim())
            .configure(health::configure_health);

        if let Some(pool) = &script_pool {
            if scripting_enabled {
                app = app
                    .app_data(web::Data::new(Arc::clone(pool)))
                    .configure(debug::configure_debug);
            }
        }

        app.default_service(web::route().to(dispatcher::dispatch))
    })
    .bind((host.as_str(), port))?
    .run();

    info!("Server started successfully");

    // Graceful shutdown handling
    tokio::select! {
        result = server => {
            match result {
                Ok(_) => info!("Server stopped gracefully"),
                Err(e) => error!("Server error: {}", e),
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, stopping server...");
        }
    }

    gateway.stop().await;

    Ok(())
}

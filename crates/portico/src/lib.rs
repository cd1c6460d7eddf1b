//! # Portico
//!
//! A multi-tenant HTTP reverse proxy with a scripted routing layer,
//! built with Rust and Actix Web.
//!
//! Each tenant declares HTTP routes, route groups, and middleware chains
//! either declaratively (configuration) or programmatically (startup
//! scripts running on an embedded rhai runtime). Incoming requests are
//! dispatched to the owning tenant, through its middleware chain, and
//! either to a script handler or to one of the tenant's backend services
//! via reverse proxy with active health checking and circuit breaking.
//!
//! ## Quick Start
//!
//! ```no_run
//! use portico::config::settings::load_settings;
//! use portico::gateway::Gateway;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = load_settings()?;
//!     let gateway = Gateway::start(settings).await?;
//!
//!     // Hand gateway.service() to the HTTP server as the catch-all
//!     // handler; see the portico-gateway binary for the full wiring.
//!
//!     gateway.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────────┐   ┌──────────────────┐
//! │   Client    │──▶│   Portico Gateway        │──▶│   Backends       │
//! └─────────────┘   │  ┌───────────────────────┤   └──────────────────┘
//!                   │  │ Global middleware     ││
//!                   │  ├───────────────────────┤│   ┌──────────────────┐
//!                   │  │ Radix router (tenants)││──▶│ Script handlers  │
//!                   │  ├───────────────────────┤│   │ (interpreter     │
//!                   │  │ Health + breakers     ││   │  pool)           │
//!                   │  └───────────────────────┘│   └──────────────────┘
//!                   └──────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - Configuration loading and validation
//! - [`models`] - Configuration model and error types
//! - [`routing`] - Router composition and the request dispatcher
//! - [`proxy`] - Backends, selection, circuit breakers, health checks,
//!   and the reverse proxy itself
//! - [`scripting`] - Interpreter pool, script compiler/cache, the HTTP
//!   bridge, and the startup registration surface
//! - [`routes`] - Built-in `/health` and `/debug/script-pool` endpoints
//! - [`gateway`] - Start/stop lifecycle tying the above together
//! - [`logs`] - Logging configuration
//!
//! ## Environment Variables
//!
//! - `PORTICO_CONFIG_PATH`: Configuration file path (default: `./config.json`)
//! - `PORTICO_HOST`: Server bind address (default: `0.0.0.0`)
//! - `PORTICO_PORT`: Server port (default: `5900`)
//! - `NO_COLOR`: Disable colored log output

pub mod config;
pub mod gateway;
pub mod logs;
pub mod models;
pub mod proxy;
pub mod routes;
pub mod routing;
pub mod scripting;

//! Built-in gateway endpoints.
//!
//! Everything else the gateway serves goes through the dispatcher's
//! catch-all; these are the two fixed top-level routes.

pub mod debug;
pub mod health;

//! Logging configuration for the gateway binary and tests.

pub mod logger;

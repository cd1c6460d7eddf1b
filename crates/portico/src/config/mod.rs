//! Configuration loading and validation.
//!
//! [`settings::load_settings`] reads the JSON configuration file;
//! [`validation::ConfigValidator`] performs the structural checks the
//! gateway requires before it will serve traffic.

pub mod settings;
pub mod validation;

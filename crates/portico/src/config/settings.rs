use crate::models::error::GatewayError;
use crate::models::settings::Settings;
use log::{debug, warn};
use std::path::Path;

/// Configuration schema version this build understands.
const SUPPORTED_VERSION: u8 = 1;

/// Loads the gateway configuration from the file system.
///
/// The file path comes from `PORTICO_CONFIG_PATH` when set, otherwise
/// `./config.json`.
///
/// # Examples
///
/// ```no_run
/// use portico::config::settings::load_settings;
///
/// let settings = load_settings().expect("Failed to load configuration");
/// println!("Loaded {} tenants", settings.tenants.len());
/// ```
pub fn load_settings() -> Result<Settings, GatewayError> {
    let config_path =
        std::env::var("PORTICO_CONFIG_PATH").unwrap_or_else(|_| "./config.json".to_string());
    load_settings_from(&config_path)
}

/// Reads and deserializes one configuration file.
///
/// Only document-level guardrails live here: the schema version must be
/// one this build understands, and a gateway with no tenants and
/// scripting disabled is flagged because it can only ever serve the
/// built-in routes. Structural validation of tenants, routes, and
/// services belongs to [`crate::config::validation::ConfigValidator`],
/// which the gateway runs before serving.
///
/// # Errors
///
/// [`GatewayError::Startup`] when the file is unreadable, is not valid
/// JSON for the [`Settings`] schema, or declares an unsupported version.
pub fn load_settings_from(path: impl AsRef<Path>) -> Result<Settings, GatewayError> {
    let path = path.as_ref();

    let contents = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::Startup(format!("cannot read config file {}: {}", path.display(), e))
    })?;

    let settings: Settings = serde_json::from_str(&contents).map_err(|e| {
        GatewayError::Startup(format!(
            "config file {} does not match the settings schema: {}",
            path.display(),
            e
        ))
    })?;

    if settings.version != SUPPORTED_VERSION {
        return Err(GatewayError::Startup(format!(
            "config file {} declares version {} but this build supports version {}",
            path.display(),
            settings.version,
            SUPPORTED_VERSION
        )));
    }

    if settings.tenants.is_empty() && !settings.scripting.enabled {
        warn!(
            "component=config event=empty_gateway path={} message=\"no tenants and scripting \
             disabled; only built-in routes will serve\"",
            path.display()
        );
    }

    debug!(
        "component=config event=settings_loaded path={} tenants={} scripting_enabled={}",
        path.display(),
        settings.tenants.len(),
        settings.scripting.enabled
    );

    Ok(settings)
}

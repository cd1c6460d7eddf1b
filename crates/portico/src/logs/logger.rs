//! Logger configuration and structured output formatting.
//!
//! Gateway modules log key-value payloads prefixed with a `component=`
//! tag (`component=proxy event=proxy_error ...`). The formatter peels
//! that tag off into its own column so lines group by component at a
//! glance while the remaining `event=...` fields pass through verbatim
//! for grep and log shippers.

use chrono::Utc;
use env_logger::Builder;
use log::{Level, LevelFilter};
use std::env;
use std::io::Write;

/// Width of the component column; sized for the widest tag in the tree
/// (`dispatcher`).
const COMPONENT_FIELD_WIDTH: usize = 10;

/// Splits a `component=name rest...` payload into the component tag and
/// the remaining fields. Messages without the prefix are returned
/// untouched.
fn split_component(message: &str) -> (Option<&str>, &str) {
    let rest = match message.strip_prefix("component=") {
        Some(rest) => rest,
        None => return (None, message),
    };
    match rest.split_once(' ') {
        Some((component, fields)) => (Some(component), fields),
        None => (Some(rest), ""),
    }
}

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[31m",
        Level::Warn => "\x1b[33m",
        Level::Info => "\x1b[32m",
        Level::Debug => "\x1b[34m",
        Level::Trace => "\x1b[35m",
    }
}

/// Configure and initialize the application's logging system.
///
/// One line per record:
///
/// ```text
/// 2026-08-01T10:30:00.123Z INFO  gateway    event=request request_id=... status=200
/// 2026-08-01T10:30:01.480Z WARN  proxy      event=circuit_breaker_state_change from=closed to=open
/// ```
///
/// Records without a `component=` prefix (startup chatter, third-party
/// crates) fall back to the last segment of their module path. Timestamps
/// are UTC so lines collate across instances. Honors `RUST_LOG` for
/// level filtering and `NO_COLOR` to disable ANSI colors. Call once
/// during startup.
pub fn configure_logger() {
    let no_color = env::var("NO_COLOR").is_ok();

    Builder::new()
        .format(move |buf, record| {
            let message = record.args().to_string();
            let (component, fields) = split_component(&message);
            let component = component
                .or_else(|| record.module_path().and_then(|m| m.rsplit("::").next()))
                .unwrap_or("-");

            let level = format!("{:<5}", record.level());
            let level = if no_color {
                level
            } else {
                format!("{}{}\x1b[0m", level_color(record.level()), level)
            };

            writeln!(
                buf,
                "{} {} {:<width$} {}",
                Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                level,
                component,
                fields,
                width = COMPONENT_FIELD_WIDTH,
            )
        })
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
}

use std::env;

use crate::parking_lot::Once;

static ONCE: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoLevel {
    Silent,
    Info,
    Warning,
    Error,
}

/// Install the process-wide log subscriber. The filter comes from `RUST_LOG` when present,
/// otherwise from `DEBUG_LEVEL` (1 = info, 2 = warning, 3 = error). Calling this more than once,
/// or after the embedding program installed its own subscriber, is harmless.
pub fn initialize() {
    ONCE.call_once(|| {
        let directive = match env::var("RUST_LOG") {
            Ok(filter) if !filter.is_empty() => filter,
            _ => level_directive(env::var("DEBUG_LEVEL").ok().as_deref()).to_owned(),
        };

        install(&directive);
    });
}

#[cfg(feature = "logger")]
fn install(directive: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("off"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(not(feature = "logger"))]
fn install(_directive: &str) {}

pub fn print(info: &str, level: InfoLevel) {
    if info.is_empty() {
        return;
    }

    match level {
        InfoLevel::Info => tracing::info!(target: "rusty_appserver", "{}", info),
        InfoLevel::Warning => tracing::warn!(target: "rusty_appserver", "{}", info),
        InfoLevel::Error => tracing::error!(target: "rusty_appserver", "{}", info),
        InfoLevel::Silent => {}
    }
}

fn level_directive(raw: Option<&str>) -> &'static str {
    match raw {
        Some("1") => "rusty_appserver=info",
        Some("2") => "rusty_appserver=warn",
        Some("3") => "rusty_appserver=error",
        _ => "off",
    }
}

//! Logging initialisation.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the application.
///
/// `default_level` is used unless `RUST_LOG` is set. Unknown levels fall back
/// to `info`.
pub fn init(default_level: &str) {
    let lvl = match default_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(lvl));

    // try_init so tests and libraries can call this multiple times without panicking
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

// Initialize the global tracing subscriber.
// RUST_LOG always wins, otherwise quiet mode only shows warnings
pub fn init_logging(quiet: bool) {
    let level = if quiet {
        "warn"
    } else if cfg!(debug_assertions) {
        "trace"
    } else {
        "info"
    };

    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(f) => (f, true),
        Err(_) => (EnvFilter::new(level), false),
    };

    let fmt_layer = fmt::layer().with_target(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();

    if !from_env {
        info!("\"RUST_LOG\" variable not set, defaulting to {level}");
    }
}

//! `tracing` setup for the worker binaries and tests.
//!
//! The log level is configurable via `RUST_LOG`, e.g.
//! `RUST_LOG=info,sable_ln=debug`. Defaults to `info`.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global `tracing` subscriber. Panics if one is already set.
pub fn init(rust_log: Option<&str>) {
    try_init(rust_log).expect("Failed to set up logger");
}

/// Use this to initialize the logger in tests. Multiple test threads race to
/// set the global subscriber; losing the race is fine.
pub fn init_for_testing() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let _ = try_init(rust_log.as_deref());
}

fn try_init(rust_log: Option<&str>) -> Result<(), String> {
    let filter = match rust_log {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|e| format!("Bad RUST_LOG directives: {e}"))?,
        None => EnvFilter::new("info"),
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| format!("Subscriber already set: {e}"))
}

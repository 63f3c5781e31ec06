//! Structured logging initialization.
//!
//! Configures the tracing subscriber for the server. The `GRPC_VERBOSITY`
//! environment variable (DEBUG, INFO, ERROR; default ERROR) gates the sink;
//! the `RUST_LOG` environment variable takes precedence when set.

use std::sync::Once;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Initialize the logging subsystem. Safe to call more than once; only the
/// first call installs a subscriber, and an already-installed global
/// subscriber is left in place.
pub fn init() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(verbosity_directive())
        };

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init();
    });
}

fn verbosity_directive() -> &'static str {
    match std::env::var("GRPC_VERBOSITY")
        .unwrap_or_default()
        .to_ascii_uppercase()
        .as_str()
    {
        "DEBUG" => "debug",
        "INFO" => "info",
        _ => "error",
    }
}

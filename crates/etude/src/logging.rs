// src/logging.rs
//! Tracing subscriber setup.
//!
//! The level comes from `RUST_LOG` and defaults to `info`, which prints one
//! line per request:
//!
//! ```bash
//! RUST_LOG=etude=debug etude 0.0.0.0 8080 ./public
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a formatted stdout subscriber. Later calls are ignored, so tests
/// may call this freely.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Like [`init_logging`], with `level` used when `RUST_LOG` is unset.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init();
}

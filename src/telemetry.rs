//! Tracing bootstrap for embedders and examples.
//!
//! e6r itself only emits `tracing` events; installing a subscriber is the
//! host's job. `init()` is a convenience for binaries that do not bring
//! their own: fmt output filtered by `E6R_LOG` (falling back to `RUST_LOG`,
//! then `info`).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Install a fmt subscriber filtered from the environment.
///
/// Safe to call once per process; returns quietly if a global subscriber is
/// already set.
pub fn init() {
    let filter = std::env::var("E6R_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .try_init();
}

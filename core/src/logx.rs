use tracing_subscriber::{fmt, EnvFilter};

/// Initialize `tracing` once. `RUST_LOG` wins; otherwise `default_level` applies.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

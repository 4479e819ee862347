//! Tracing bootstrap.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Respects `STRAND_LOG` (falling back to `default_level`), e.g.
/// `STRAND_LOG=strand_runtime=debug,strand_store=info`. Safe to call more
/// than once; subsequent calls are no-ops.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_env("STRAND_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

//! Telemetry helpers for structured logging and tracing.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "metric_scheduler=info";

/// Initialize tracing. Callers can install their own subscriber; this helper
/// installs an env-filtered fmt subscriber only if none is set, falling back
/// to [`DEFAULT_FILTER`].
pub fn init_tracing() {
    init_tracing_with_default(DEFAULT_FILTER);
}

/// Like [`init_tracing`], with a caller-chosen fallback directive.
pub fn init_tracing_with_default(directive: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing_with_default("debug");
        init_tracing();
        assert!(tracing::dispatcher::has_been_set());
    }
}

use std::sync::Once;

/// Install a `tracing` subscriber for the crate. Safe to call more than once.
///
/// `RUST_LOG` overrides the default `roomkit_core=debug` filter.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("roomkit_core=debug"));
        // Another subscriber may already be installed by the host application.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .try_init();
    });
}

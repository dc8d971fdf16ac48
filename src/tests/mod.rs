pub mod engine_tests;

/// Initialise tracing output for tests that want it; safe to call from every
/// test, first caller wins.
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize test logging in a thread-safe way.
/// Safe to call from every test; only the first call installs the
/// subscriber. Filtering follows `RUST_LOG`.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();

        // Another harness may already have installed one.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

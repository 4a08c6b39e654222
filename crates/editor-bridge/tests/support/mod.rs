pub mod mock_editor;

/// Route library logs to the test harness. Filtered by `RUST_LOG`, errors
/// only when unset.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

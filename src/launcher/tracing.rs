/// Initializes structured logging for the launcher binary.
///
/// Verbosity comes from the `RUST_LOG` environment variable, e.g.
/// `RUST_LOG=service_launcher=debug`. Lifecycle operations log inside spans
/// carrying the service id and version.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

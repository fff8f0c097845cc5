use tracing_subscriber::EnvFilter;

/// Initializes a fmt subscriber honouring `RUST_LOG`, defaulting to info.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(service_name: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
    tracing::debug!(service = service_name, "tracing initialized");
}

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber: `RUST_LOG` plus `info` for this
/// service and the meter client.
pub fn init_tracing() {
    let filter = EnvFilter::from_default_env()
        .add_directive("collection_service=info".parse().unwrap_or_else(|_| "info".parse().unwrap()))
        .add_directive("meter_client=info".parse().unwrap_or_else(|_| "info".parse().unwrap()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber: `EnvFilter` (default `info`, `debug`
/// with `--verbose`) plus a JSON-formatted stdout layer. Safe to call more
/// than once; later calls are no-ops.
pub fn init_telemetry(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let json_layer = tracing_subscriber::fmt::layer().json().flatten_event(true);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .try_init();
}

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize `tracing` once. `RUST_LOG` wins; otherwise `default_level`.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Map a `-v` count to a filter level: 0 keeps `base`, then debug, then trace.
pub fn level_for_verbosity(base: &str, verbose: u8) -> &str {
    match verbose {
        0 => base,
        1 => "debug",
        _ => "trace",
    }
}

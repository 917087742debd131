//! Subscriber setup.

use keel_config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber writing to stderr. `RUST_LOG` wins over
/// `filter` when set. Returns `false` if a global subscriber was already
/// installed.
pub fn init(filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .try_init()
        .is_ok()
}

pub fn init_from(config: &LoggingConfig) -> bool {
    init(&config.filter)
}

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match config.format {
        LogFormat::Json => fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => fmt().with_env_filter(filter).init(),
    }
}

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::error::ProxyError;

/// Install the global subscriber.
///
/// The level is `debug` when debug output is enabled and `info` otherwise;
/// `RUST_LOG` overrides both. An empty `log.file` logs to stdout.
pub fn init_logging(settings: &Settings) -> Result<(), ProxyError> {
    let level = if settings.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if settings.log.file.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(true)
            .try_init()
            .ok();
    } else {
        let path = PathBuf::from(&settings.log.file);
        let file = File::create(&path).map_err(|source| ProxyError::Logging {
            path: path.clone(),
            source,
        })?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
            .ok();
    }

    info!("Logging initialized at level: {}", level);
    Ok(())
}

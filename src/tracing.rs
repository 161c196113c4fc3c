use tracing_subscriber::EnvFilter;

use crate::conf;

/// Installs the global subscriber. `RUST_LOG` wins over the configured
/// level when set.
pub fn init() -> anyhow::Result<()> {
    let conf = conf::global();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(conf.log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| {
            anyhow::anyhow!("Failed to init tracing subscriber: {error}")
        })?;
    Ok(())
}

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. The configured level is the
/// default; `RUST_LOG` takes precedence when set.
pub fn init(log_level: &str) -> Result<()> {
	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(log_level))
		.map_err(|e| anyhow!("invalid log level [{log_level}]: {e}"))?;

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.try_init()
		.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

use crate::constants::{
	CONFIG_ROOT, DEFAULT_CONFIG_ROOT, SETTINGS_ENV_PREFIX, SETTINGS_FILE_NAME,
};
use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, Environment, File};
use ethers::types::H160;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
pub struct CommandLineOptions {
	/// Directory the settings file is read from.
	#[clap(long = "config-root", env = CONFIG_ROOT, default_value = DEFAULT_CONFIG_ROOT)]
	pub config_root: String,

	/// Overrides the log level from the settings file.
	#[clap(long = "log-level")]
	pub log_level: Option<String>,
}

impl Default for CommandLineOptions {
	fn default() -> Self {
		CommandLineOptions { config_root: DEFAULT_CONFIG_ROOT.to_string(), log_level: None }
	}
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainSettings {
	pub chain_id: u64,
	pub ws_endpoint: String,
	pub http_endpoint: String,
	pub bridge_address: String,
	pub light_client_address: Option<String>,
	pub db_dir: PathBuf,
}

fn default_log_level() -> String {
	"info".to_string()
}

fn default_receive_token_delay_secs() -> u64 {
	crate::constants::RECEIVE_TOKEN_DELAY.as_secs()
}

fn default_confirmations() -> u64 {
	crate::constants::CONFIRMATIONS
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
	pub web3q: ChainSettings,
	pub ethereum: ChainSettings,

	pub keystore_file: PathBuf,
	pub keystore_password: String,

	#[serde(default = "default_log_level")]
	pub log_level: String,

	/// Upper bound, in seconds, on how long a receipt-proof submission
	/// waits for its covering header to confirm.
	#[serde(default = "default_receive_token_delay_secs")]
	pub receive_token_delay_secs: u64,

	#[serde(default = "default_confirmations")]
	pub confirmations: u64,
}

impl Settings {
	/// Reads the settings file under the config root, with
	/// `RELAYER__`-prefixed environment variables taking precedence, then
	/// applies command line overrides.
	pub fn new(opts: CommandLineOptions) -> Result<Self> {
		let file = PathBuf::from(&opts.config_root).join(SETTINGS_FILE_NAME);
		let mut settings: Settings = Config::builder()
			.add_source(File::from(file.clone()))
			.add_source(Environment::with_prefix(SETTINGS_ENV_PREFIX).separator("__"))
			.build()
			.and_then(|config| config.try_deserialize())
			.with_context(|| format!("Failed to load settings from {}", file.display()))?;

		if let Some(log_level) = opts.log_level {
			settings.log_level = log_level;
		}

		settings.validate()?;
		Ok(settings)
	}

	fn validate(&self) -> Result<()> {
		for (name, chain) in [("web3q", &self.web3q), ("ethereum", &self.ethereum)] {
			if chain.ws_endpoint.is_empty() || chain.http_endpoint.is_empty() {
				anyhow::bail!("both endpoints of the {name} chain must be configured");
			}
		}
		if self.web3q.chain_id == self.ethereum.chain_id {
			anyhow::bail!("the two configured chains share chain id {}", self.web3q.chain_id);
		}
		Ok(())
	}

	#[cfg(test)]
	pub fn new_test() -> Self {
		Config::builder()
			.add_source(File::from_str(
				r#"
					keystore_file = "./keystore.json"
					keystore_password = "password"

					[web3q]
					chain_id = 3333
					ws_endpoint = "ws://127.0.0.1:8546"
					http_endpoint = "http://127.0.0.1:8545"
					bridge_address = "0x0000000000000000000000000000000003330002"
					db_dir = "./test-db-w3q"

					[ethereum]
					chain_id = 5
					ws_endpoint = "ws://127.0.0.1:9546"
					http_endpoint = "http://127.0.0.1:9545"
					bridge_address = "0x0C31d8aCF362353622F16F24A576a310A75312FA"
					light_client_address = "0xCb101a3fEe489E8ef3E713F8085d241849bf8382"
					db_dir = "./test-db-eth"
				"#,
				config::FileFormat::Toml,
			))
			.build()
			.and_then(|config| config.try_deserialize())
			.unwrap()
	}
}

/// Immutable per-chain descriptor with parsed addresses, handed to the
/// relayer at construction.
#[derive(Debug, Clone)]
pub struct ChainConfig {
	pub chain_id: u64,
	pub ws_endpoint: String,
	pub http_endpoint: String,
	pub bridge_address: H160,
	pub light_client_address: Option<H160>,
	pub db_dir: PathBuf,
}

impl TryFrom<&ChainSettings> for ChainConfig {
	type Error = anyhow::Error;

	fn try_from(settings: &ChainSettings) -> Result<Self> {
		Ok(ChainConfig {
			chain_id: settings.chain_id,
			ws_endpoint: settings.ws_endpoint.clone(),
			http_endpoint: settings.http_endpoint.clone(),
			bridge_address: settings
				.bridge_address
				.parse()
				.with_context(|| format!("invalid bridge address {}", settings.bridge_address))?,
			light_client_address: settings
				.light_client_address
				.as_ref()
				.map(|address| {
					address
						.parse()
						.with_context(|| format!("invalid light client address {address}"))
				})
				.transpose()?,
			db_dir: settings.db_dir.clone(),
		})
	}
}

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use relayer_engine::{
	contracts::bridge_catalog,
	coordinator::Coordinator,
	eth::{
		header::{EpochHeaderCodec, PlainHeaderCodec},
		rpc::EthDualRpcClient,
	},
	logging,
	pipelines::{add_ethereum_to_web3q_pipeline, add_web3q_to_ethereum_pipeline},
	relayer::ChainRelayer,
	settings::{ChainConfig, CommandLineOptions, Settings},
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> std::process::ExitCode {
	let settings = match Settings::new(CommandLineOptions::parse()) {
		Ok(settings) => settings,
		Err(error) => {
			eprintln!("Error reading settings: {error:#}");
			return std::process::ExitCode::FAILURE
		},
	};

	if let Err(error) = run(settings).await {
		// The subscriber may not be installed yet when init itself failed.
		eprintln!("relayer-engine failed: {error:#}");
		return std::process::ExitCode::FAILURE
	}
	std::process::ExitCode::SUCCESS
}

async fn run(settings: Settings) -> Result<()> {
	logging::init(&settings.log_level)?;
	info!("starting the relayer engine");

	let web3q = ChainConfig::try_from(&settings.web3q)?;
	let ethereum = ChainConfig::try_from(&settings.ethereum)?;

	let catalog = Arc::new(bridge_catalog(
		web3q.chain_id,
		web3q.bridge_address,
		ethereum.chain_id,
		ethereum.bridge_address,
		ethereum
			.light_client_address
			.ok_or_else(|| anyhow!("the ethereum chain needs a light client address configured"))?,
	)?);

	// Connect both node pairs up front so configuration errors (dead
	// endpoints, mismatched chain ids) surface before anything starts.
	let web3q_client = EthDualRpcClient::connect(
		&web3q.ws_endpoint,
		&web3q.http_endpoint,
		web3q.chain_id,
		Arc::new(EpochHeaderCodec),
	)
	.await
	.context("Failed to connect the Web3Q clients")?;
	let ethereum_client = EthDualRpcClient::connect(
		&ethereum.ws_endpoint,
		&ethereum.http_endpoint,
		ethereum.chain_id,
		Arc::new(PlainHeaderCodec),
	)
	.await
	.context("Failed to connect the Ethereum clients")?;

	let mut coordinator = Coordinator::new();

	let web3q_relayer = ChainRelayer::new(
		web3q.clone(),
		Arc::new(web3q_client),
		catalog.clone(),
		Arc::new(EpochHeaderCodec),
		&settings.keystore_file,
		&settings.keystore_password,
		coordinator.root_cancel(),
	)?;
	let ethereum_relayer = ChainRelayer::new(
		ethereum.clone(),
		Arc::new(ethereum_client),
		catalog.clone(),
		Arc::new(PlainHeaderCodec),
		&settings.keystore_file,
		&settings.keystore_password,
		coordinator.root_cancel(),
	)?;

	coordinator.add_chain_relayer(web3q_relayer);
	coordinator.add_chain_relayer(ethereum_relayer);

	add_web3q_to_ethereum_pipeline(&mut coordinator, &settings, &catalog, &web3q, &ethereum)?;
	add_ethereum_to_web3q_pipeline(&mut coordinator, &settings, &catalog, &ethereum, &web3q)?;

	let coordinator = Arc::new(coordinator);
	tokio::spawn({
		let coordinator = coordinator.clone();
		async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				info!("interrupt received, shutting down");
				coordinator.stop();
			}
		}
	});

	coordinator.start().await
}

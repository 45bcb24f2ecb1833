use relayer_engine::{
	eth::{header::PlainHeaderCodec, rpc::EthDualRpcClient},
	settings::{CommandLineOptions, Settings},
};
use std::sync::Arc;

#[tokio::test]
#[ignore = "Depends on configured live endpoints; useful for manually observing the engine"]
async fn can_connect_and_subscribe_new_heads() {
	let settings = Settings::new(CommandLineOptions::default()).unwrap();

	let client = EthDualRpcClient::connect(
		&settings.ethereum.ws_endpoint,
		&settings.ethereum.http_endpoint,
		settings.ethereum.chain_id,
		Arc::new(PlainHeaderCodec),
	)
	.await
	.unwrap();

	use relayer_engine::eth::rpc::EthRpcApi;
	let (_subscription, mut heads) = client.subscribe_new_heads().await.unwrap();
	let header = heads.recv().await.unwrap();
	println!("observed header {}", header.number);
}

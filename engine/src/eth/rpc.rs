use crate::{
	constants::DATA_CHANNEL_CAPACITY,
	eth::{
		event::LogEvent,
		header::{ChainHeader, HeaderCodec},
	},
};
use anyhow::{anyhow, bail, Context, Result};
use ethers::{
	prelude::*,
	providers::{Http, Provider, Ws},
	types::{
		transaction::eip2718::TypedTransaction, Bytes, Eip1559TransactionRequest, Filter,
		TransactionReceipt, H160, H256, U256,
	},
};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Merkle proof material binding one receipt log to a header's
/// receipts-root, as returned by the `eth_getReceiptProof` RPC.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptProofData {
	pub value: Bytes,
	pub key: Bytes,
	pub path: Bytes,
}

/// Handle to a live subscription pump. Dropping it (or calling
/// [`Subscription::unsubscribe`]) tears the underlying subscription down.
pub struct Subscription {
	err_rx: mpsc::Receiver<anyhow::Error>,
	stop_tx: Option<oneshot::Sender<()>>,
}

impl Subscription {
	pub(crate) fn new(
		err_rx: mpsc::Receiver<anyhow::Error>,
		stop_tx: oneshot::Sender<()>,
	) -> Self {
		Subscription { err_rx, stop_tx: Some(stop_tx) }
	}

	/// Resolves once the subscription fails. Pends forever after a clean
	/// unsubscribe, so it is safe to hold in a `select!` branch.
	pub async fn err(&mut self) -> anyhow::Error {
		match self.err_rx.recv().await {
			Some(e) => e,
			None => std::future::pending().await,
		}
	}

	pub fn unsubscribe(mut self) {
		if let Some(stop_tx) = self.stop_tx.take() {
			let _ = stop_tx.send(());
		}
	}

	/// A subscription plus the handles a test uses to drive it: send on the
	/// error sender to simulate a subscription failure.
	#[cfg(test)]
	pub fn test_handles() -> (Self, mpsc::Sender<anyhow::Error>, oneshot::Receiver<()>) {
		let (err_tx, err_rx) = mpsc::channel(1);
		let (stop_tx, stop_rx) = oneshot::channel();
		(Subscription::new(err_rx, stop_tx), err_tx, stop_rx)
	}
}

/// Everything the relayer needs from one chain's node endpoints.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait EthRpcApi: Send + Sync + 'static {
	fn chain_id(&self) -> u64;

	/// New-head stream, lossy-tolerant. The stream closes (surfacing an
	/// error on the subscription handle) when the subscription fails.
	async fn subscribe_new_heads(&self)
		-> Result<(Subscription, mpsc::Receiver<ChainHeader>)>;

	/// Log stream filtered on `(address, topic0)`.
	async fn subscribe_filter_logs(
		&self,
		address: H160,
		topic: H256,
	) -> Result<(Subscription, mpsc::Receiver<LogEvent>)>;

	/// Header at the given height, or the latest header when `None`.
	async fn header_by_number(&self, number: Option<u64>) -> Result<ChainHeader>;

	async fn pending_nonce_at(&self, address: H160) -> Result<U256>;

	async fn suggest_gas_tip_cap(&self) -> Result<U256>;

	async fn estimate_gas(&self, tx: &Eip1559TransactionRequest) -> Result<U256>;

	async fn call_contract(&self, to: H160, data: Vec<u8>) -> Result<Vec<u8>>;

	async fn receipt_proof(&self, tx_hash: H256) -> Result<ReceiptProofData>;

	async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>>;

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256>;
}

/// WS client for subscriptions and reads, HTTP client strictly for the final
/// `send_raw_transaction`, so a dying subscription session can never take
/// transaction submission down with it.
#[derive(Clone)]
pub struct EthDualRpcClient {
	ws: Arc<Provider<Ws>>,
	http: Provider<Http>,
	chain_id: u64,
	codec: Arc<dyn HeaderCodec>,
}

impl EthDualRpcClient {
	pub async fn connect(
		ws_endpoint: &str,
		http_endpoint: &str,
		expected_chain_id: u64,
		codec: Arc<dyn HeaderCodec>,
	) -> Result<Self> {
		if ws_endpoint.is_empty() || http_endpoint.is_empty() {
			bail!("both the WS and the HTTP endpoint must be configured");
		}

		let ws = Arc::new(Provider::new(
			Ws::connect(ws_endpoint)
				.await
				.with_context(|| format!("Failed to connect WS client to {ws_endpoint}"))?,
		));
		let http = Provider::<Http>::try_from(http_endpoint)
			.with_context(|| format!("Invalid HTTP endpoint {http_endpoint}"))?;

		let ws_chain_id = ws.get_chainid().await.context("Failed to fetch WS chain id")?;
		let http_chain_id = http.get_chainid().await.context("Failed to fetch HTTP chain id")?;
		if ws_chain_id != http_chain_id {
			bail!(
				"chain id {ws_chain_id} of the WS client is different to chain id {http_chain_id} of the HTTP client"
			);
		}
		if ws_chain_id != U256::from(expected_chain_id) {
			bail!(
				"Connected to nodes with chain id {ws_chain_id}, expected {expected_chain_id}. Please check the configuration file"
			);
		}

		Ok(EthDualRpcClient { ws, http, chain_id: expected_chain_id, codec })
	}
}

#[async_trait::async_trait]
impl EthRpcApi for EthDualRpcClient {
	fn chain_id(&self) -> u64 {
		self.chain_id
	}

	async fn subscribe_new_heads(
		&self,
	) -> Result<(Subscription, mpsc::Receiver<ChainHeader>)> {
		let ws = self.ws.clone();
		let codec = self.codec.clone();
		let chain_id = self.chain_id;

		let (ready_tx, ready_rx) = oneshot::channel();
		let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
		let (err_tx, err_rx) = mpsc::channel(1);
		let (sink_tx, sink_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);

		tokio::spawn(async move {
			let mut stream = match ws.subscribe::<_, serde_json::Value>(["newHeads"]).await {
				Ok(stream) => stream,
				Err(e) => {
					let _ = ready_tx.send(Err(anyhow::Error::new(e)
						.context("Failed to subscribe to new heads with the WS client")));
					return
				},
			};
			if ready_tx.send(Ok(())).is_err() {
				let _ = stream.unsubscribe().await;
				return
			}
			loop {
				tokio::select! {
					_ = &mut stop_rx => {
						let _ = stream.unsubscribe().await;
						return
					},
					item = stream.next() => match item {
						Some(raw) => match codec.decode_block(raw) {
							Ok(header) =>
								if sink_tx.send(header).await.is_err() {
									return
								},
							Err(e) => warn!(chain_id, "dropping undecodable header: {e:#}"),
						},
						None => {
							let _ = err_tx
								.send(anyhow!("new-head subscription stream ended"))
								.await;
							return
						},
					},
				}
			}
		});

		ready_rx.await.context("new-head subscription task died")??;
		Ok((Subscription::new(err_rx, stop_tx), sink_rx))
	}

	async fn subscribe_filter_logs(
		&self,
		address: H160,
		topic: H256,
	) -> Result<(Subscription, mpsc::Receiver<LogEvent>)> {
		let ws = self.ws.clone();
		let chain_id = self.chain_id;
		let filter = Filter::new().address(address).topic0(topic);

		let (ready_tx, ready_rx) = oneshot::channel();
		let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
		let (err_tx, err_rx) = mpsc::channel(1);
		let (sink_tx, sink_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);

		tokio::spawn(async move {
			let mut stream = match ws.subscribe_logs(&filter).await {
				Ok(stream) => stream,
				Err(e) => {
					let _ = ready_tx.send(Err(anyhow::Error::new(e)
						.context("Failed to subscribe to logs with the WS client")));
					return
				},
			};
			if ready_tx.send(Ok(())).is_err() {
				let _ = stream.unsubscribe().await;
				return
			}
			loop {
				tokio::select! {
					_ = &mut stop_rx => {
						let _ = stream.unsubscribe().await;
						return
					},
					item = stream.next() => match item {
						Some(log) => match LogEvent::try_from(log) {
							Ok(event) =>
								if sink_tx.send(event).await.is_err() {
									return
								},
							Err(e) => warn!(chain_id, "dropping unusable log: {e:#}"),
						},
						None => {
							let _ =
								err_tx.send(anyhow!("log subscription stream ended")).await;
							return
						},
					},
				}
			}
		});

		ready_rx.await.context("log subscription task died")??;
		Ok((Subscription::new(err_rx, stop_tx), sink_rx))
	}

	async fn header_by_number(&self, number: Option<u64>) -> Result<ChainHeader> {
		let tag = match number {
			Some(n) => format!("{n:#x}"),
			None => "latest".to_string(),
		};
		let raw: serde_json::Value = self
			.ws
			.request("eth_getBlockByNumber", (tag, false))
			.await
			.context("eth_getBlockByNumber failed")?;
		if raw.is_null() {
			bail!("Getting block for block number {number:?} returned None");
		}
		self.codec.decode_block(raw)
	}

	async fn pending_nonce_at(&self, address: H160) -> Result<U256> {
		Ok(self
			.ws
			.get_transaction_count(address, Some(BlockNumber::Pending.into()))
			.await?)
	}

	async fn suggest_gas_tip_cap(&self) -> Result<U256> {
		Ok(self.ws.request("eth_maxPriorityFeePerGas", ()).await?)
	}

	async fn estimate_gas(&self, tx: &Eip1559TransactionRequest) -> Result<U256> {
		Ok(self
			.ws
			.estimate_gas(&TypedTransaction::Eip1559(tx.clone()), None)
			.await?)
	}

	async fn call_contract(&self, to: H160, data: Vec<u8>) -> Result<Vec<u8>> {
		let tx = TypedTransaction::Eip1559(
			Eip1559TransactionRequest::new().to(to).data(data).value(0),
		);
		Ok(self.ws.call(&tx, None).await?.to_vec())
	}

	async fn receipt_proof(&self, tx_hash: H256) -> Result<ReceiptProofData> {
		Ok(self
			.ws
			.request("eth_getReceiptProof", [tx_hash])
			.await
			.context("eth_getReceiptProof failed")?)
	}

	async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>> {
		Ok(self.ws.get_transaction_receipt(tx_hash).await?)
	}

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
		Ok(self
			.http
			.send_raw_transaction(raw)
			.await
			.context("Failed to broadcast transaction to the network")?
			.tx_hash())
	}
}

use crate::{
	common::make_periodic_tick,
	contracts::{
		ETHEREUM_BRIDGE_CONTRACT, LIGHT_CLIENT_CONTRACT, RECEIVE_FROM_ETH_FUNC,
		RECEIVE_FROM_WEB3Q_FUNC, SUBMIT_HEADER_FUNC, WEB3Q_BRIDGE_CONTRACT,
	},
	eth::{event::LogEvent, header::ChainHeader},
	relayer::{ChainRelayerApi, RelayerRegistry, RoutingError},
	task::{
		status::{StatusCell, TaskStateError, TaskStatus},
		Task, TaskType,
	},
};
use anyhow::{anyhow, Result};
use ethers::{
	abi::Token,
	types::{H160, H256},
};
use futures::{future::BoxFuture, FutureExt};
use std::{
	sync::{Arc, Mutex},
	time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Source and target relayers a submission runs against, resolved from the
/// registry when the task starts.
#[derive(Clone)]
pub struct SubmitContext {
	pub source: Arc<dyn ChainRelayerApi>,
	pub target: Arc<dyn ChainRelayerApi>,
}

/// Builds, signs and sends the transaction for one consumed value. The
/// function owns its preconditions (e.g. waiting for confirmations); the
/// task owns the retry policy.
pub type SubmitFn<T> =
	Box<dyn Fn(SubmitContext, T) -> BoxFuture<'static, Result<H256>> + Send + Sync>;

#[async_trait::async_trait]
pub trait SubmitApi: Task {
	async fn start(&self, registry: Arc<RelayerRegistry>) -> Result<()>;
}

/// Consumes values from its input channel and turns each into a signed
/// transaction on the target chain.
pub struct SubmitTxTask<T> {
	name: String,
	source_chain_id: u64,
	target_chain_id: u64,
	contract_address: H160,
	contract_name: &'static str,
	method_name: &'static str,
	submit_fn: SubmitFn<T>,
	receiver: Mutex<Option<mpsc::Receiver<T>>>,
	status: StatusCell,
	cancel_tx: watch::Sender<bool>,
	retry_times: u32,
	block_interval: Duration,
}

impl<T: Clone + Send + 'static> SubmitTxTask<T> {
	/// Returns the task and the sender side of its input channel, for the
	/// orchestrator to bind.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		name: String,
		source_chain_id: u64,
		target_chain_id: u64,
		contract_address: H160,
		contract_name: &'static str,
		method_name: &'static str,
		submit_fn: SubmitFn<T>,
		retry_times: u32,
		block_interval: Duration,
	) -> (Arc<Self>, mpsc::Sender<T>) {
		let (input_tx, input_rx) = mpsc::channel(crate::constants::DATA_CHANNEL_CAPACITY);
		let (cancel_tx, _) = watch::channel(false);
		(
			Arc::new(SubmitTxTask {
				name,
				source_chain_id,
				target_chain_id,
				contract_address,
				contract_name,
				method_name,
				submit_fn,
				receiver: Mutex::new(Some(input_rx)),
				status: StatusCell::new(),
				cancel_tx,
				retry_times,
				block_interval,
			}),
			input_tx,
		)
	}

	fn resolve(&self, registry: &RelayerRegistry) -> Result<SubmitContext> {
		let source = registry
			.get(&self.source_chain_id)
			.ok_or(RoutingError::UnknownChainId(self.source_chain_id))?
			.clone();
		let target = registry
			.get(&self.target_chain_id)
			.ok_or(RoutingError::UnknownChainId(self.target_chain_id))?
			.clone();
		Ok(SubmitContext { source, target })
	}
}

impl<T: Clone + Send + 'static> Task for SubmitTxTask<T> {
	fn task_type(&self) -> TaskType {
		TaskType::SubmitTx
	}

	fn name(&self) -> &str {
		&self.name
	}

	fn status(&self) -> TaskStatus {
		self.status.get()
	}

	fn target_chain_id(&self) -> u64 {
		self.target_chain_id
	}

	fn stop(&self) -> Result<(), TaskStateError> {
		self.status.transition(TaskStatus::Running, TaskStatus::Stopping)?;
		info!(task = %self.name, chain_id = self.target_chain_id, "stopping submit task");
		self.cancel_tx.send_replace(true);
		Ok(())
	}
}

#[async_trait::async_trait]
impl<T: Clone + Send + 'static> SubmitApi for SubmitTxTask<T> {
	async fn start(&self, registry: Arc<RelayerRegistry>) -> Result<()> {
		// Subscribe before going Running so a racing stop() is never missed.
		let mut cancel_rx = self.cancel_tx.subscribe();
		self.status
			.transition(TaskStatus::NoStart, TaskStatus::Running)
			.map_err(|e| anyhow!("{} start rejected: {e}", self.name))?;

		let context = match self.resolve(&registry) {
			Ok(context) => context,
			Err(e) => {
				self.status.acknowledge_stopped();
				return Err(e)
			},
		};

		let mut receiver = self
			.receiver
			.lock()
			.unwrap()
			.take()
			.ok_or_else(|| anyhow!("{} started twice", self.name))?;

		info!(
			task = %self.name,
			method = self.method_name,
			contract = self.contract_name,
			contract_address = ?self.contract_address,
			chain_id = self.target_chain_id,
			"submit task running"
		);

		loop {
			let value = tokio::select! {
				_ = cancel_rx.changed() => {
					self.status.acknowledge_stopped();
					info!(task = %self.name, "submit task stopped");
					return Ok(())
				},
				maybe_value = receiver.recv() => match maybe_value {
					Some(value) => value,
					None => {
						info!(task = %self.name, "input channel closed, submit task stopping");
						self.status.acknowledge_stopped();
						return Ok(())
					},
				},
			};

			for attempt in 1..=self.retry_times {
				match (self.submit_fn)(context.clone(), value.clone()).await {
					Ok(tx_hash) => {
						info!(
							task = %self.name,
							method = self.method_name,
							chain_id = self.target_chain_id,
							tx_hash = ?tx_hash,
							"submitted transaction"
						);
						break
					},
					Err(e) if attempt < self.retry_times => {
						warn!(
							task = %self.name,
							method = self.method_name,
							attempt,
							"failed to submit transaction: {e:#}"
						);
						tokio::select! {
							_ = cancel_rx.changed() => {
								self.status.acknowledge_stopped();
								return Ok(())
							},
							_ = tokio::time::sleep(self.block_interval) => {},
						}
					},
					Err(e) => {
						// Logged and dropped; the task itself keeps serving
						// the channel.
						error!(
							task = %self.name,
							method = self.method_name,
							chain_id = self.target_chain_id,
							"giving up after {} attempts: {e:#}",
							self.retry_times
						);
					},
				}
			}
		}
	}
}

/// Polls the target chain until `tx_hash` is buried under `confirmations`
/// blocks, then publishes `height` as confirmed.
async fn track_confirmations(
	target: Arc<dyn ChainRelayerApi>,
	tx_hash: H256,
	height: u64,
	confirmed_height_tx: Arc<watch::Sender<u64>>,
	confirmations: u64,
	poll_interval: Duration,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	let mut tick = make_periodic_tick(poll_interval, false);
	loop {
		tokio::select! {
			_ = shutdown_rx.changed() => return,
			_ = tick.tick() => {},
		}
		match target.transaction_receipt(tx_hash).await {
			Ok(Some(receipt)) => {
				if let Some(included_at) = receipt.block_number {
					if target.latest_header_number() >= included_at.as_u64() + confirmations {
						confirmed_height_tx
							.send_modify(|current| *current = (*current).max(height));
						info!(
							height,
							tx_hash = ?tx_hash,
							"submit-header transaction confirmed"
						);
						return
					}
				}
			},
			Ok(None) => {},
			Err(e) => warn!(tx_hash = ?tx_hash, "failed to poll receipt: {e:#}"),
		}
	}
}

/// Submit task calling `submitHeader` on the target light client. Each
/// successful submission spawns a tracker that releases the height on
/// `confirmed_height_tx` once the transaction is confirmed.
#[allow(clippy::too_many_arguments)]
pub fn new_submit_header_task(
	source_chain_id: u64,
	target_chain_id: u64,
	light_client_address: H160,
	confirmed_height_tx: Arc<watch::Sender<u64>>,
	confirmations: u64,
	retry_times: u32,
	block_interval: Duration,
	shutdown_rx: watch::Receiver<bool>,
) -> (Arc<SubmitTxTask<ChainHeader>>, mpsc::Sender<ChainHeader>) {
	let submit_fn: SubmitFn<ChainHeader> = Box::new(move |context, header| {
		let confirmed_height_tx = confirmed_height_tx.clone();
		let shutdown_rx = shutdown_rx.clone();
		async move {
			let (header_bytes, commit_bytes) = context.source.pack_header(&header)?;
			let raw = context
				.target
				.build_and_sign_tx(
					LIGHT_CLIENT_CONTRACT,
					SUBMIT_HEADER_FUNC,
					light_client_address,
					vec![
						Token::Uint(header.number.into()),
						Token::Bytes(header_bytes),
						Token::Bytes(commit_bytes),
						Token::Bool(false),
					],
				)
				.await?;
			let tx_hash = context.target.submit_tx(raw).await?;
			tokio::spawn(track_confirmations(
				context.target.clone(),
				tx_hash,
				header.number,
				confirmed_height_tx,
				confirmations,
				block_interval,
				shutdown_rx,
			));
			Ok(tx_hash)
		}
		.boxed()
	});

	SubmitTxTask::new(
		"submit-header".to_string(),
		source_chain_id,
		target_chain_id,
		light_client_address,
		LIGHT_CLIENT_CONTRACT,
		SUBMIT_HEADER_FUNC,
		submit_fn,
		retry_times,
		block_interval,
	)
}

/// Submit task proving a source-chain `SendToken` log to the target bridge
/// via `receiveFromWeb3q`.
pub fn new_receive_token_task(
	source_chain_id: u64,
	target_chain_id: u64,
	bridge_address: H160,
	retry_times: u32,
	block_interval: Duration,
) -> (Arc<SubmitTxTask<LogEvent>>, mpsc::Sender<LogEvent>) {
	let submit_fn: SubmitFn<LogEvent> = Box::new(move |context, log| {
		async move {
			let proof = context.source.receipt_proof(log.tx_hash).await?;
			let raw = context
				.target
				.build_and_sign_tx(
					ETHEREUM_BRIDGE_CONTRACT,
					RECEIVE_FROM_WEB3Q_FUNC,
					bridge_address,
					vec![
						Token::Uint(log.block_number.into()),
						Token::Tuple(vec![
							Token::Bytes(proof.value.to_vec()),
							Token::Bytes(proof.path.to_vec()),
							Token::Bytes(proof.key.to_vec()),
						]),
						Token::Uint(log.log_index),
					],
				)
				.await?;
			context.target.submit_tx(raw).await
		}
		.boxed()
	});

	SubmitTxTask::new(
		"receive-token".to_string(),
		source_chain_id,
		target_chain_id,
		bridge_address,
		ETHEREUM_BRIDGE_CONTRACT,
		RECEIVE_FROM_WEB3Q_FUNC,
		submit_fn,
		retry_times,
		block_interval,
	)
}

/// Submit task for the opposite direction: a native-chain `SendToken` log is
/// relayed to the wrapped-side bridge with `receiveFromEth`, once the source
/// chain has buried the log under `confirmations` blocks.
pub fn new_receive_token_on_wrapped_task(
	source_chain_id: u64,
	target_chain_id: u64,
	bridge_address: H160,
	confirmations: u64,
	retry_times: u32,
	block_interval: Duration,
	shutdown_rx: watch::Receiver<bool>,
) -> (Arc<SubmitTxTask<LogEvent>>, mpsc::Sender<LogEvent>) {
	let submit_fn: SubmitFn<LogEvent> = Box::new(move |context, log| {
		let mut shutdown_rx = shutdown_rx.clone();
		async move {
			let expected_height = log.block_number + confirmations;
			let mut tick = make_periodic_tick(block_interval, true);
			while context.source.latest_header_number() < expected_height {
				tokio::select! {
					_ = shutdown_rx.changed() => return Err(anyhow!("shutting down")),
					_ = tick.tick() => {},
				}
			}

			let raw = context
				.target
				.build_and_sign_tx(
					WEB3Q_BRIDGE_CONTRACT,
					RECEIVE_FROM_ETH_FUNC,
					bridge_address,
					vec![
						Token::FixedBytes(log.tx_hash.as_bytes().to_vec()),
						Token::Uint(log.log_index),
					],
				)
				.await?;
			context.target.submit_tx(raw).await
		}
		.boxed()
	});

	SubmitTxTask::new(
		"receive-token-wrapped".to_string(),
		source_chain_id,
		target_chain_id,
		bridge_address,
		WEB3Q_BRIDGE_CONTRACT,
		RECEIVE_FROM_ETH_FUNC,
		submit_fn,
		retry_times,
		block_interval,
	)
}

use crate::{
	constants::{BLOCK_INTERVAL, MONITOR_TASK_INBOX_CAPACITY, RESUBSCRIBE_ATTEMPTS},
	contracts::{
		ContractCatalog, BLOCK_EXIST_FUNC, GET_NEXT_EPOCH_HEIGHT_FUNC, LIGHT_CLIENT_CONTRACT,
	},
	db::HeaderStore,
	eth::{
		event::LogEvent,
		header::{ChainHeader, HeaderCodec},
		rpc::{EthRpcApi, ReceiptProofData, Subscription},
	},
	settings::ChainConfig,
	task::{
		manager::TaskManager,
		monitor::MonitorApi,
		status::{StatusCell, TaskStatus},
		Task,
	},
};
use anyhow::{anyhow, Context, Result};
use ethers::{
	abi::Token,
	signers::{LocalWallet, Signer},
	types::{
		transaction::eip2718::TypedTransaction, Bytes, Eip1559TransactionRequest,
		TransactionReceipt, H160, H256, U256,
	},
};
use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc, Mutex, OnceLock, Weak,
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
	#[error("no chain relayer registered for chain id {0}")]
	UnknownChainId(u64),
	#[error("monitor task targets chain {task_chain_id} but was offered to the relayer for chain {relayer_chain_id}")]
	ChainMismatch { task_chain_id: u64, relayer_chain_id: u64 },
}

/// Relayers resolvable by chain id. Built during init and frozen before the
/// coordinator starts; run-time mutation is a program error.
pub type RelayerRegistry = std::collections::HashMap<u64, Arc<dyn ChainRelayerApi>>;

/// One per chain: owns the chain's client facade, signing key, header cache
/// and monitor-task inbox.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait ChainRelayerApi: Send + Sync + 'static {
	fn chain_id(&self) -> u64;

	fn relayer_address(&self) -> H160;

	/// Highest header number seen on this chain. Written only from within
	/// this relayer's event loop.
	fn latest_header_number(&self) -> u64;

	fn status(&self) -> TaskStatus;

	/// Late-bound so relayers and the manager can be constructed
	/// independently; the coordinator wires them together.
	fn set_task_manager(&self, manager: Arc<TaskManager>);

	/// Validates and enqueues a monitor task on this relayer's inbox. May
	/// block when the inbox is full.
	async fn send_monitor_task(&self, task: Arc<dyn MonitorApi>) -> Result<()>;

	/// The relayer's event loop. Returns once stopped; returns an error if
	/// the relayer had to shut itself down.
	async fn run(&self) -> Result<()>;

	/// Stops this relayer, cascading stop to every monitor task bound to
	/// its chain id.
	async fn stop(&self) -> Result<()>;

	async fn subscribe_event(
		&self,
		contract: H160,
		event_id: H256,
	) -> Result<(Subscription, mpsc::Receiver<LogEvent>)>;

	async fn subscribe_latest_header(
		&self,
	) -> Result<(Subscription, mpsc::Receiver<ChainHeader>)>;

	/// Header at the given height: local cache first, RPC on a miss.
	async fn block_header(&self, number: u64) -> Result<ChainHeader>;

	async fn receipt_proof(&self, tx_hash: H256) -> Result<ReceiptProofData>;

	/// Splits a header into the `(header, commit)` byte strings the light
	/// client takes, using this chain's codec.
	fn pack_header(&self, header: &ChainHeader) -> Result<(Vec<u8>, Vec<u8>)>;

	/// ABI-packs, prices, and signs a dynamic-fee transaction calling
	/// `method_name` on the named contract.
	async fn build_and_sign_tx(
		&self,
		contract_name: &str,
		method_name: &str,
		to: H160,
		args: Vec<Token>,
	) -> Result<Bytes>;

	async fn submit_tx(&self, raw: Bytes) -> Result<H256>;

	/// Read-only contract call via the catalog; returns raw return data.
	async fn call_contract(
		&self,
		contract_name: &str,
		method_name: &str,
		args: Vec<Token>,
	) -> Result<Vec<u8>>;

	async fn is_header_exist_at_light_client(&self, number: u64) -> Result<bool>;

	async fn next_epoch_height(&self) -> Result<u64>;

	async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>>;
}

pub struct ChainRelayer {
	config: ChainConfig,
	client: Arc<dyn EthRpcApi>,
	wallet: LocalWallet,
	address: H160,
	catalog: Arc<ContractCatalog>,
	codec: Arc<dyn HeaderCodec>,
	db: HeaderStore,
	latest_header_number: AtomicU64,

	inbox_tx: mpsc::Sender<Arc<dyn MonitorApi>>,
	inbox_rx: Mutex<Option<mpsc::Receiver<Arc<dyn MonitorApi>>>>,

	// Failures of detached monitor tasks funnel back into the event loop.
	task_err_tx: mpsc::Sender<anyhow::Error>,
	task_err_rx: Mutex<Option<mpsc::Receiver<anyhow::Error>>>,

	status: StatusCell,
	root_cancel: watch::Receiver<bool>,
	local_cancel_tx: watch::Sender<bool>,
	manager: OnceLock<Arc<TaskManager>>,
	self_ref: Weak<ChainRelayer>,
}

impl ChainRelayer {
	pub fn new(
		config: ChainConfig,
		client: Arc<dyn EthRpcApi>,
		catalog: Arc<ContractCatalog>,
		codec: Arc<dyn HeaderCodec>,
		keystore_file: &std::path::Path,
		keystore_password: &str,
		root_cancel: watch::Receiver<bool>,
	) -> Result<Arc<Self>> {
		let wallet = LocalWallet::decrypt_keystore(keystore_file, keystore_password)
			.with_context(|| format!("Failed to decrypt keystore {}", keystore_file.display()))?
			.with_chain_id(config.chain_id);
		let db = HeaderStore::open(&config.db_dir, config.chain_id)?;
		Ok(Self::assemble(config, client, catalog, codec, wallet, db, root_cancel))
	}

	fn assemble(
		config: ChainConfig,
		client: Arc<dyn EthRpcApi>,
		catalog: Arc<ContractCatalog>,
		codec: Arc<dyn HeaderCodec>,
		wallet: LocalWallet,
		db: HeaderStore,
		root_cancel: watch::Receiver<bool>,
	) -> Arc<Self> {
		let (inbox_tx, inbox_rx) = mpsc::channel(MONITOR_TASK_INBOX_CAPACITY);
		let (task_err_tx, task_err_rx) = mpsc::channel(MONITOR_TASK_INBOX_CAPACITY);
		let (local_cancel_tx, _) = watch::channel(false);
		let address = wallet.address();
		Arc::new_cyclic(|self_ref| ChainRelayer {
			config,
			client,
			wallet,
			address,
			catalog,
			codec,
			db,
			latest_header_number: AtomicU64::new(0),
			inbox_tx,
			inbox_rx: Mutex::new(Some(inbox_rx)),
			task_err_tx,
			task_err_rx: Mutex::new(Some(task_err_rx)),
			status: StatusCell::new(),
			root_cancel,
			local_cancel_tx,
			manager: OnceLock::new(),
			self_ref: self_ref.clone(),
		})
	}

	/// Relayer over the given client with a throwaway key, no keystore.
	#[cfg(test)]
	pub fn new_test(
		config: ChainConfig,
		client: Arc<dyn EthRpcApi>,
		catalog: Arc<ContractCatalog>,
		codec: Arc<dyn HeaderCodec>,
		db_dir: &std::path::Path,
		root_cancel: watch::Receiver<bool>,
	) -> Arc<Self> {
		use std::str::FromStr;
		// just a fake key
		let wallet = LocalWallet::from_str(
			"000000000000000000000000000000000000000000000000000000000000aaaa",
		)
		.unwrap()
		.with_chain_id(config.chain_id);
		let db = HeaderStore::open(db_dir, config.chain_id).unwrap();
		Self::assemble(config, client, catalog, codec, wallet, db, root_cancel)
	}

	fn check_task_validity(&self, task: &Arc<dyn MonitorApi>) -> Result<()> {
		if task.target_chain_id() != self.chain_id() {
			error!(
				expect_chain_id = self.chain_id(),
				actual_chain_id = task.target_chain_id(),
				"received task with invalid chain id"
			);
			return Err(RoutingError::ChainMismatch {
				task_chain_id: task.target_chain_id(),
				relayer_chain_id: self.chain_id(),
			}
			.into())
		}
		if task.status() != TaskStatus::NoStart {
			return Err(anyhow!("task {} with invalid status [{}]", task.name(), task.status()))
		}
		Ok(())
	}

	/// Fills in and signs the dynamic-fee skeleton: gas limit from the
	/// node's estimate, `fee_cap = 2 * base_fee + tip_cap`, pending nonce.
	async fn build_tx_request(
		&self,
		contract_name: &str,
		method_name: &str,
		to: H160,
		args: &[Token],
	) -> Result<Eip1559TransactionRequest> {
		let data = self.catalog.encode_call(contract_name, method_name, args)?;

		let mut tx = Eip1559TransactionRequest::new()
			.from(self.address)
			.to(to)
			.data(data)
			.value(0u64)
			.chain_id(self.chain_id());

		let gas = self.client.estimate_gas(&tx).await.context("Failed to estimate gas")?;
		let tip_cap = self
			.client
			.suggest_gas_tip_cap()
			.await
			.context("Failed to fetch gas tip cap")?;
		let base_fee = self
			.client
			.header_by_number(None)
			.await
			.context("Failed to fetch latest header for the base fee")?
			.base_fee_per_gas;
		let nonce = self
			.client
			.pending_nonce_at(self.address)
			.await
			.context("Failed to fetch pending nonce")?;

		tx = tx
			.gas(gas)
			.max_priority_fee_per_gas(tip_cap)
			.max_fee_per_gas(base_fee * 2 + tip_cap)
			.nonce(nonce);
		Ok(tx)
	}

	fn cascade_stop(&self) {
		if let Some(manager) = self.manager.get() {
			manager.stop_tasks_by_chain_id(self.chain_id());
		}
		self.local_cancel_tx.send_replace(true);
	}

	async fn resubscribe_heads(
		&self,
		cancel_rx: &mut watch::Receiver<bool>,
	) -> Option<(Subscription, mpsc::Receiver<ChainHeader>)> {
		for attempt in 1..=RESUBSCRIBE_ATTEMPTS {
			match self.client.subscribe_new_heads().await {
				Ok(pair) => {
					info!(chain_id = self.chain_id(), "re-subscribed to new heads");
					return Some(pair)
				},
				Err(e) => {
					warn!(
						chain_id = self.chain_id(),
						attempt,
						"failed to re-subscribe to new heads: {e:#}"
					);
					if attempt < RESUBSCRIBE_ATTEMPTS {
						tokio::select! {
							_ = cancel_rx.changed() => return None,
							_ = tokio::time::sleep(BLOCK_INTERVAL) => {},
						}
					}
				},
			}
		}
		None
	}

	fn store_header(&self, header: &ChainHeader) {
		if let Err(e) = self.db.put_header(header) {
			warn!(
				chain_id = self.chain_id(),
				header_number = header.number,
				"failed to persist header: {e:#}"
			);
		}
		self.latest_header_number.fetch_max(header.number, Ordering::SeqCst);
	}
}

#[async_trait::async_trait]
impl ChainRelayerApi for ChainRelayer {
	fn chain_id(&self) -> u64 {
		self.config.chain_id
	}

	fn relayer_address(&self) -> H160 {
		self.address
	}

	fn latest_header_number(&self) -> u64 {
		self.latest_header_number.load(Ordering::SeqCst)
	}

	fn status(&self) -> TaskStatus {
		self.status.get()
	}

	fn set_task_manager(&self, manager: Arc<TaskManager>) {
		let _ = self.manager.set(manager);
	}

	async fn send_monitor_task(&self, task: Arc<dyn MonitorApi>) -> Result<()> {
		self.check_task_validity(&task)?;
		self.inbox_tx
			.send(task)
			.await
			.map_err(|_| anyhow!("relayer {} inbox is closed", self.chain_id()))
	}

	async fn run(&self) -> Result<()> {
		self.status
			.transition(TaskStatus::NoStart, TaskStatus::Running)
			.map_err(|e| anyhow!("relayer {} start rejected: {e}", self.chain_id()))?;
		info!(chain_id = self.chain_id(), address = ?self.address, "chain relayer started");

		let this: Arc<dyn ChainRelayerApi> = self
			.self_ref
			.upgrade()
			.ok_or_else(|| anyhow!("relayer {} dropped before start", self.chain_id()))?;

		let (mut head_sub, mut head_rx) = self
			.client
			.subscribe_new_heads()
			.await
			.with_context(|| format!("relayer {} failed to subscribe to new heads", self.chain_id()))?;

		let mut inbox = self
			.inbox_rx
			.lock()
			.unwrap()
			.take()
			.ok_or_else(|| anyhow!("relayer {} started twice", self.chain_id()))?;
		let mut task_errs = self.task_err_rx.lock().unwrap().take().expect("taken with inbox");

		let mut root_cancel = self.root_cancel.clone();
		let mut local_cancel = self.local_cancel_tx.subscribe();

		loop {
			if *root_cancel.borrow() || *local_cancel.borrow() {
				self.status.acknowledge_stopped();
				info!(chain_id = self.chain_id(), "chain relayer stopped");
				return Ok(())
			}

			let head_loss = tokio::select! {
				maybe_task = inbox.recv() => {
					let Some(task) = maybe_task else { continue };
					info!(chain_id = self.chain_id(), task = %task.name(), "received monitor task");
					if task.target_chain_id() != self.chain_id() {
						error!(
							expect_chain_id = self.chain_id(),
							actual_chain_id = task.target_chain_id(),
							"dropping task with invalid chain id"
						);
						continue
					}
					match task.exec_monitor_fn(this.clone()).await {
						Ok(()) => {
							let err_tx = self.task_err_tx.clone();
							tokio::spawn(async move {
								if let Err(e) = task.start_monitor().await {
									let _ = err_tx.send(e).await;
								}
							});
						},
						Err(e) => error!(
							chain_id = self.chain_id(),
							task = %task.name(),
							"failed to establish subscription: {e:#}"
						),
					}
					continue
				},
				maybe_header = head_rx.recv() => match maybe_header {
					Some(header) => {
						self.store_header(&header);
						continue
					},
					None => anyhow!("new-head stream closed"),
				},
				err = head_sub.err() => err,
				Some(err) = task_errs.recv() => {
					error!(chain_id = self.chain_id(), "monitor task failed: {err:#}");
					self.cascade_stop();
					self.status.acknowledge_stopped();
					return Err(err)
				},
				_ = root_cancel.changed() => continue,
				_ = local_cancel.changed() => continue,
			};

			warn!(
				chain_id = self.chain_id(),
				"the latest header subscription happened error: {head_loss:#}"
			);
			match self.resubscribe_heads(&mut local_cancel).await {
				Some((sub, rx)) => {
					head_sub = sub;
					head_rx = rx;
				},
				None if *local_cancel.borrow() || *root_cancel.borrow() => continue,
				None => {
					error!(
						chain_id = self.chain_id(),
						"failed to re-subscribe to new heads, shutting the relayer down"
					);
					self.cascade_stop();
					self.status.acknowledge_stopped();
					return Err(head_loss)
				},
			}
		}
	}

	async fn stop(&self) -> Result<()> {
		if self.status.get() != TaskStatus::Running {
			return Err(anyhow!(
				"relayer {} stop with invalid status [{}]",
				self.chain_id(),
				self.status.get()
			))
		}
		info!(chain_id = self.chain_id(), "stopping chain relayer");
		self.cascade_stop();
		Ok(())
	}

	async fn subscribe_event(
		&self,
		contract: H160,
		event_id: H256,
	) -> Result<(Subscription, mpsc::Receiver<LogEvent>)> {
		self.client.subscribe_filter_logs(contract, event_id).await
	}

	async fn subscribe_latest_header(
		&self,
	) -> Result<(Subscription, mpsc::Receiver<ChainHeader>)> {
		self.client.subscribe_new_heads().await
	}

	async fn block_header(&self, number: u64) -> Result<ChainHeader> {
		if let Some(header) = self.db.get_header(number) {
			return Ok(header)
		}
		self.client.header_by_number(Some(number)).await
	}

	async fn receipt_proof(&self, tx_hash: H256) -> Result<ReceiptProofData> {
		self.client.receipt_proof(tx_hash).await
	}

	fn pack_header(&self, header: &ChainHeader) -> Result<(Vec<u8>, Vec<u8>)> {
		self.codec.pack_for_submission(header)
	}

	async fn build_and_sign_tx(
		&self,
		contract_name: &str,
		method_name: &str,
		to: H160,
		args: Vec<Token>,
	) -> Result<Bytes> {
		let tx = self.build_tx_request(contract_name, method_name, to, &args).await?;
		let typed = TypedTransaction::Eip1559(tx);
		let signature = self
			.wallet
			.sign_transaction(&typed)
			.await
			.context("Failed to sign transaction")?;
		Ok(typed.rlp_signed(&signature))
	}

	async fn submit_tx(&self, raw: Bytes) -> Result<H256> {
		self.client.send_raw_transaction(raw).await
	}

	async fn call_contract(
		&self,
		contract_name: &str,
		method_name: &str,
		args: Vec<Token>,
	) -> Result<Vec<u8>> {
		let contract = self.catalog.contract(contract_name)?;
		let data = self.catalog.encode_call(contract_name, method_name, &args)?;
		self.client.call_contract(contract.address, data).await
	}

	async fn is_header_exist_at_light_client(&self, number: u64) -> Result<bool> {
		let raw = self
			.call_contract(
				LIGHT_CLIENT_CONTRACT,
				BLOCK_EXIST_FUNC,
				vec![Token::Uint(U256::from(number))],
			)
			.await?;
		match self
			.catalog
			.decode_output(LIGHT_CLIENT_CONTRACT, BLOCK_EXIST_FUNC, &raw)?
			.first()
		{
			Some(Token::Bool(exists)) => Ok(*exists),
			other => Err(anyhow!("unexpected blockExist return value: {other:?}")),
		}
	}

	async fn next_epoch_height(&self) -> Result<u64> {
		let raw = self
			.call_contract(LIGHT_CLIENT_CONTRACT, GET_NEXT_EPOCH_HEIGHT_FUNC, vec![])
			.await?;
		match self
			.catalog
			.decode_output(LIGHT_CLIENT_CONTRACT, GET_NEXT_EPOCH_HEIGHT_FUNC, &raw)?
			.first()
		{
			Some(Token::Uint(height)) => Ok(height.as_u64()),
			other => Err(anyhow!("unexpected getNextEpochHeight return value: {other:?}")),
		}
	}

	async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>> {
		self.client.transaction_receipt(tx_hash).await
	}
}

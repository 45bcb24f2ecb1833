use crate::{
	common::recv_or_pending,
	constants::DATA_CHANNEL_CAPACITY,
	eth::{event::LogEvent, header::ChainHeader},
	relayer::{ChainRelayerApi, RelayerRegistry, RoutingError},
	task::{
		status::{StatusCell, TaskStateError, TaskStatus},
		Task, TaskType,
	},
};
use anyhow::{anyhow, Result};
use std::{
	collections::HashSet,
	sync::{Arc, Mutex},
	time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Enforces the cross-chain ordering rule: a receipt proof for a source
/// event at height `H` is not sent to the target bridge until the target's
/// light client has accepted a source header covering `H`.
///
/// Inputs are fed by a MonitorEvent and a MonitorHeader task on the source
/// chain; outputs are the input channels of the two submit tasks. This task
/// is the only writer of those channels.
pub struct ScheduleTask {
	name: String,
	source_chain_id: u64,
	target_chain_id: u64,

	receive_log: Mutex<Option<mpsc::Receiver<LogEvent>>>,
	receive_header: Mutex<Option<mpsc::Receiver<ChainHeader>>>,

	// Internal staging lane for candidate headers awaiting the
	// "not yet submitted" and "not yet attested" checks.
	before_send_header_tx: mpsc::Sender<ChainHeader>,
	before_send_header_rx: Mutex<Option<mpsc::Receiver<ChainHeader>>>,

	send_submit_header: Mutex<Option<mpsc::Sender<ChainHeader>>>,
	send_receive_token: Mutex<Option<mpsc::Sender<LogEvent>>>,

	/// Source heights whose submit-header transaction has confirmed on the
	/// target chain, published by the submit-header task.
	confirmed_height_rx: watch::Receiver<u64>,

	/// Fallback: a receipt proof waits at most this long for its covering
	/// header before being released anyway.
	receive_token_delay: Duration,

	status: StatusCell,
	cancel_tx: watch::Sender<bool>,
}

impl ScheduleTask {
	pub fn new(
		name: String,
		source_chain_id: u64,
		target_chain_id: u64,
		receive_log: mpsc::Receiver<LogEvent>,
		receive_header: mpsc::Receiver<ChainHeader>,
		confirmed_height_rx: watch::Receiver<u64>,
		receive_token_delay: Duration,
	) -> Arc<Self> {
		let (before_send_header_tx, before_send_header_rx) =
			mpsc::channel(DATA_CHANNEL_CAPACITY);
		let (cancel_tx, _) = watch::channel(false);
		Arc::new(ScheduleTask {
			name,
			source_chain_id,
			target_chain_id,
			receive_log: Mutex::new(Some(receive_log)),
			receive_header: Mutex::new(Some(receive_header)),
			before_send_header_tx,
			before_send_header_rx: Mutex::new(Some(before_send_header_rx)),
			send_submit_header: Mutex::new(None),
			send_receive_token: Mutex::new(None),
			confirmed_height_rx,
			receive_token_delay,
			status: StatusCell::new(),
			cancel_tx,
		})
	}

	/// Binds the submit-header task's input channel. One-shot.
	pub fn bind_submit_header(&self, sender: mpsc::Sender<ChainHeader>) -> Result<()> {
		let mut slot = self.send_submit_header.lock().unwrap();
		if slot.is_some() {
			return Err(anyhow!("{} submit-header channel already bound", self.name))
		}
		*slot = Some(sender);
		Ok(())
	}

	/// Binds the receive-token task's input channel. One-shot.
	pub fn bind_receive_token(&self, sender: mpsc::Sender<LogEvent>) -> Result<()> {
		let mut slot = self.send_receive_token.lock().unwrap();
		if slot.is_some() {
			return Err(anyhow!("{} receive-token channel already bound", self.name))
		}
		*slot = Some(sender);
		Ok(())
	}

	pub async fn start(&self, registry: Arc<RelayerRegistry>) -> Result<()> {
		// Subscribe before going Running so a racing stop() is never missed.
		let cancel_rx = self.cancel_tx.subscribe();
		self.status
			.transition(TaskStatus::NoStart, TaskStatus::Running)
			.map_err(|e| anyhow!("{} start rejected: {e}", self.name))?;

		let result = self.running(registry, cancel_rx).await;
		self.status.acknowledge_stopped();
		info!(task = %self.name, "schedule task stopped");
		result
	}

	async fn running(
		&self,
		registry: Arc<RelayerRegistry>,
		mut cancel_rx: watch::Receiver<bool>,
	) -> Result<()> {
		let source = registry
			.get(&self.source_chain_id)
			.ok_or(RoutingError::UnknownChainId(self.source_chain_id))?
			.clone();
		let target = registry
			.get(&self.target_chain_id)
			.ok_or(RoutingError::UnknownChainId(self.target_chain_id))?
			.clone();

		let send_submit_header = self
			.send_submit_header
			.lock()
			.unwrap()
			.clone()
			.ok_or_else(|| anyhow!("{} started without a submit-header channel", self.name))?;
		let send_receive_token = self
			.send_receive_token
			.lock()
			.unwrap()
			.clone()
			.ok_or_else(|| anyhow!("{} started without a receive-token channel", self.name))?;

		let mut receive_log = Some(
			self.receive_log
				.lock()
				.unwrap()
				.take()
				.ok_or_else(|| anyhow!("{} started twice", self.name))?,
		);
		let mut receive_header = self.receive_header.lock().unwrap().take();
		let mut before_send_header =
			self.before_send_header_rx.lock().unwrap().take().expect("taken with receive_log");

		// At-most-once guard for header submissions, per source height.
		let mut sent_headers: HashSet<u64> = HashSet::new();

		info!(
			task = %self.name,
			source_chain_id = self.source_chain_id,
			target_chain_id = self.target_chain_id,
			"schedule task running"
		);

		loop {
			tokio::select! {
				_ = cancel_rx.changed() => return Ok(()),

				log = recv_or_pending(&mut receive_log) => {
					self.handle_source_log(&source, &target, log, &send_receive_token).await;
				},

				header = recv_or_pending(&mut before_send_header) => {
					self.handle_header_candidate(
						&target,
						header,
						&mut sent_headers,
						&send_submit_header,
						&mut cancel_rx,
					)
					.await;
				},

				header = recv_or_pending(&mut receive_header) => {
					self.handle_new_source_header(&target, header).await;
				},
			}
		}
	}

	/// A `SendToken` log arrived from the source chain: stage its header for
	/// submission and spawn the gate that releases the receipt proof once
	/// the header is attested.
	async fn handle_source_log(
		&self,
		source: &Arc<dyn ChainRelayerApi>,
		target: &Arc<dyn ChainRelayerApi>,
		log: LogEvent,
		send_receive_token: &mpsc::Sender<LogEvent>,
	) {
		let height = log.block_number;
		info!(task = %self.name, height, tx_hash = ?log.tx_hash, "received source event log");

		match source.block_header(height).await {
			Ok(header) => {
				// try_send: the staging lane is drained by this same event
				// loop, so a blocking send here could deadlock against
				// ourselves. A dropped candidate resurfaces via the
				// epoch-header path.
				if let Err(e) = self.before_send_header_tx.try_send(header) {
					warn!(task = %self.name, height, "header staging lane unavailable: {e}");
				}
			},
			Err(e) => {
				// Without the header nothing can be attested; drop the log
				// rather than submit an unprovable receipt.
				error!(
					task = %self.name,
					height,
					"failed to fetch source header, dropping log: {e:#}"
				);
				return
			},
		}

		tokio::spawn(release_when_attested(
			self.name.clone(),
			target.clone(),
			log,
			send_receive_token.clone(),
			self.confirmed_height_rx.clone(),
			self.receive_token_delay,
			self.cancel_tx.subscribe(),
		));
	}

	/// A candidate header reached the staging lane: submit it unless that
	/// height was already handled or the light client already has it.
	async fn handle_header_candidate(
		&self,
		target: &Arc<dyn ChainRelayerApi>,
		header: ChainHeader,
		sent_headers: &mut HashSet<u64>,
		send_submit_header: &mpsc::Sender<ChainHeader>,
		cancel_rx: &mut watch::Receiver<bool>,
	) {
		let height = header.number;
		if sent_headers.contains(&height) {
			debug!(task = %self.name, height, "header already submitted, skipping");
			return
		}
		match target.is_header_exist_at_light_client(height).await {
			Ok(true) => {
				debug!(task = %self.name, height, "header already attested, skipping");
			},
			Ok(false) => {
				tokio::select! {
					result = send_submit_header.send(header) => {
						if result.is_err() {
							warn!(task = %self.name, height, "submit-header task is gone");
							return
						}
						sent_headers.insert(height);
						info!(task = %self.name, height, "header dispatched for submission");
					},
					_ = cancel_rx.changed() => {},
				}
			},
			Err(e) => {
				error!(task = %self.name, height, "light client lookup failed: {e:#}");
			},
		}
	}

	/// A new source header arrived: forward it to the staging lane only if
	/// the light client is waiting for exactly this height.
	async fn handle_new_source_header(&self, target: &Arc<dyn ChainRelayerApi>, header: ChainHeader) {
		match target.next_epoch_height().await {
			Ok(next_epoch) if header.number == next_epoch => {
				debug!(task = %self.name, height = header.number, "epoch header reached");
				if let Err(e) = self.before_send_header_tx.try_send(header) {
					warn!(task = %self.name, "header staging lane unavailable: {e}");
				}
			},
			Ok(_) => {}, // non-epoch header
			Err(e) => {
				warn!(task = %self.name, "failed to read next epoch height: {e:#}");
			},
		}
	}
}

/// Holds one receipt proof back until its covering header is usable on the
/// target: either the light client already attests the height, or the
/// submit-header transaction confirms, or the fallback delay expires.
async fn release_when_attested(
	task_name: String,
	target: Arc<dyn ChainRelayerApi>,
	log: LogEvent,
	send_receive_token: mpsc::Sender<LogEvent>,
	mut confirmed_height_rx: watch::Receiver<u64>,
	delay: Duration,
	mut cancel_rx: watch::Receiver<bool>,
) {
	let height = log.block_number;

	// The stop may have been signalled between the spawn and now.
	if *cancel_rx.borrow() {
		return
	}

	let already_attested =
		matches!(target.is_header_exist_at_light_client(height).await, Ok(true));

	if !already_attested {
		// Maps to a plain bool so no watch guard is held across an await.
		let confirmed = async {
			confirmed_height_rx.wait_for(|&confirmed| confirmed >= height).await.is_ok()
		};
		tokio::select! {
			_ = cancel_rx.changed() => return,
			publisher_alive = confirmed => {
				if !publisher_alive {
					// The confirmation publisher is gone; fall back to the
					// delay so the proof is not held forever.
					tokio::select! {
						_ = cancel_rx.changed() => return,
						_ = tokio::time::sleep(delay) => {},
					}
				}
			},
			_ = tokio::time::sleep(delay) => {
				warn!(
					task = %task_name,
					height,
					"covering header not confirmed within {delay:?}, releasing receipt proof anyway"
				);
			},
		}
	}

	if *cancel_rx.borrow() {
		return
	}
	tokio::select! {
		biased;
		_ = cancel_rx.changed() => {},
		result = send_receive_token.send(log) => {
			if result.is_err() {
				warn!(task = %task_name, height, "receive-token task is gone");
			} else {
				info!(task = %task_name, height, "receipt proof released for submission");
			}
		},
	}
}

impl Task for ScheduleTask {
	fn task_type(&self) -> TaskType {
		TaskType::Schedule
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
		info!(task = %self.name, "stopping schedule task");
		self.cancel_tx.send_replace(true);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		eth::header::test_utils::{test_commit, test_header},
		relayer::MockChainRelayerApi,
	};
	use ethers::types::{H256, U256};

	const SOURCE: u64 = 3333;
	const TARGET: u64 = 5;
	const DELAY: Duration = Duration::from_secs(200);

	struct Harness {
		schedule: Arc<ScheduleTask>,
		log_tx: mpsc::Sender<LogEvent>,
		header_tx: mpsc::Sender<ChainHeader>,
		submit_header_rx: mpsc::Receiver<ChainHeader>,
		receive_token_rx: mpsc::Receiver<LogEvent>,
		confirmed_tx: watch::Sender<u64>,
	}

	fn harness(source: MockChainRelayerApi, target: MockChainRelayerApi) -> Harness {
		let (log_tx, log_rx) = mpsc::channel(16);
		let (header_tx, header_rx) = mpsc::channel(16);
		let (confirmed_tx, confirmed_rx) = watch::channel(0u64);
		let schedule = ScheduleTask::new(
			"schedule-test".to_string(),
			SOURCE,
			TARGET,
			log_rx,
			header_rx,
			confirmed_rx,
			DELAY,
		);

		let (submit_header_tx, submit_header_rx) = mpsc::channel(16);
		let (receive_token_tx, receive_token_rx) = mpsc::channel(16);
		schedule.bind_submit_header(submit_header_tx).unwrap();
		schedule.bind_receive_token(receive_token_tx).unwrap();

		let mut registry = RelayerRegistry::new();
		registry.insert(SOURCE, Arc::new(source) as Arc<dyn ChainRelayerApi>);
		registry.insert(TARGET, Arc::new(target) as Arc<dyn ChainRelayerApi>);
		let registry = Arc::new(registry);

		tokio::spawn({
			let schedule = schedule.clone();
			async move { schedule.start(registry).await }
		});

		Harness { schedule, log_tx, header_tx, submit_header_rx, receive_token_rx, confirmed_tx }
	}

	fn source_log(height: u64) -> LogEvent {
		LogEvent {
			address: Default::default(),
			topics: vec![],
			data: vec![],
			block_number: height,
			tx_hash: H256::repeat_byte(0xaa),
			log_index: U256::from(2),
		}
	}

	fn source_with_header(height: u64) -> MockChainRelayerApi {
		let mut source = MockChainRelayerApi::new();
		source
			.expect_block_header()
			.returning(move |h| Ok(test_header(h, Some(test_commit(height)))));
		source
	}

	#[tokio::test(start_paused = true)]
	async fn happy_path_header_then_receipt() {
		let source = source_with_header(100);
		let mut target = MockChainRelayerApi::new();
		target.expect_is_header_exist_at_light_client().returning(|_| Ok(false));

		let mut h = harness(source, target);

		h.log_tx.send(source_log(100)).await.unwrap();

		// The header goes out for submission first.
		let header = h.submit_header_rx.recv().await.unwrap();
		assert_eq!(header.number, 100);

		// No receipt proof before the header is confirmed.
		assert!(h.receive_token_rx.try_recv().is_err());

		// The submit-header task reports the confirmed height; only now is
		// the receipt proof released.
		h.confirmed_tx.send(100).unwrap();
		let log = h.receive_token_rx.recv().await.unwrap();
		assert_eq!(log.block_number, 100);
		assert_eq!(log.log_index, U256::from(2));

		// Exactly one header submission for that height.
		assert!(h.submit_header_rx.try_recv().is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn already_attested_header_short_circuits() {
		let source = source_with_header(100);
		let mut target = MockChainRelayerApi::new();
		target.expect_is_header_exist_at_light_client().returning(|_| Ok(true));

		let mut h = harness(source, target);
		h.log_tx.send(source_log(100)).await.unwrap();

		// Receipt proof flows immediately, no header submission at all.
		let log = h.receive_token_rx.recv().await.unwrap();
		assert_eq!(log.block_number, 100);
		assert!(h.submit_header_rx.try_recv().is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn duplicate_log_submits_header_once() {
		let source = source_with_header(100);
		let mut target = MockChainRelayerApi::new();
		target.expect_is_header_exist_at_light_client().returning(|_| Ok(false));

		let mut h = harness(source, target);
		h.log_tx.send(source_log(100)).await.unwrap();
		h.log_tx.send(source_log(100)).await.unwrap();

		assert_eq!(h.submit_header_rx.recv().await.unwrap().number, 100);

		h.confirmed_tx.send(100).unwrap();
		// Both receipt proofs go out (dedup is the bridge's concern)...
		assert_eq!(h.receive_token_rx.recv().await.unwrap().block_number, 100);
		assert_eq!(h.receive_token_rx.recv().await.unwrap().block_number, 100);
		// ...but the header was submitted at most once.
		assert!(h.submit_header_rx.try_recv().is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn unconfirmed_header_releases_after_the_delay() {
		let source = source_with_header(100);
		let mut target = MockChainRelayerApi::new();
		target.expect_is_header_exist_at_light_client().returning(|_| Ok(false));

		let mut h = harness(source, target);
		h.log_tx.send(source_log(100)).await.unwrap();

		assert_eq!(h.submit_header_rx.recv().await.unwrap().number, 100);

		// Nobody confirms the header; the fallback delay must release the
		// proof eventually (paused time fast-forwards through it).
		let log = tokio::time::timeout(DELAY * 2, h.receive_token_rx.recv())
			.await
			.expect("released within the delay window")
			.unwrap();
		assert_eq!(log.block_number, 100);
	}

	#[tokio::test(start_paused = true)]
	async fn only_the_next_epoch_header_is_forwarded() {
		let source = source_with_header(100);
		let mut target = MockChainRelayerApi::new();
		target.expect_next_epoch_height().returning(|| Ok(100));
		target.expect_is_header_exist_at_light_client().returning(|_| Ok(false));

		let mut h = harness(source, target);

		// Non-epoch header: dropped.
		h.header_tx.send(test_header(99, Some(test_commit(99)))).await.unwrap();
		// Epoch header: staged and submitted.
		h.header_tx.send(test_header(100, Some(test_commit(100)))).await.unwrap();

		let submitted = h.submit_header_rx.recv().await.unwrap();
		assert_eq!(submitted.number, 100);
		assert!(h.submit_header_rx.try_recv().is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn stop_prevents_further_sends() {
		let source = source_with_header(100);
		let mut target = MockChainRelayerApi::new();
		target.expect_is_header_exist_at_light_client().returning(|_| Ok(false));

		let mut h = harness(source, target);

		// A log whose gate is still waiting when the task stops.
		h.log_tx.send(source_log(100)).await.unwrap();
		assert_eq!(h.submit_header_rx.recv().await.unwrap().number, 100);

		tokio::time::timeout(Duration::from_secs(5), async {
			while h.schedule.status() != TaskStatus::Running {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();
		h.schedule.stop().unwrap();

		tokio::time::timeout(Duration::from_secs(5), async {
			while h.schedule.status() != TaskStatus::Stopped {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();

		// Confirming after the stop must not release anything: the gate
		// observed the cancellation.
		h.confirmed_tx.send(100).unwrap();
		tokio::time::sleep(Duration::from_secs(1)).await;
		assert!(h.receive_token_rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn second_bind_fails() {
		let (_log_tx, log_rx) = mpsc::channel(1);
		let (_header_tx, header_rx) = mpsc::channel(1);
		let (_confirmed_tx, confirmed_rx) = watch::channel(0u64);
		let schedule = ScheduleTask::new(
			"schedule-test".to_string(),
			SOURCE,
			TARGET,
			log_rx,
			header_rx,
			confirmed_rx,
			DELAY,
		);

		let (tx, _rx) = mpsc::channel(1);
		schedule.bind_submit_header(tx.clone()).unwrap();
		assert!(schedule.bind_submit_header(tx).is_err());
	}

	#[tokio::test]
	async fn starting_without_bound_outputs_fails() {
		let (_log_tx, log_rx) = mpsc::channel(1);
		let (_header_tx, header_rx) = mpsc::channel(1);
		let (_confirmed_tx, confirmed_rx) = watch::channel(0u64);
		let schedule = ScheduleTask::new(
			"schedule-test".to_string(),
			SOURCE,
			TARGET,
			log_rx,
			header_rx,
			confirmed_rx,
			DELAY,
		);

		let registry = Arc::new(RelayerRegistry::new());
		assert!(schedule.start(registry).await.is_err());
		assert_eq!(schedule.status(), TaskStatus::Stopped);
	}
}

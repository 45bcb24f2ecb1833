use crate::{
	relayer::{ChainRelayerApi, RelayerRegistry, RoutingError},
	task::{
		manager::TaskManager,
		monitor::MonitorApi,
		pool::PoolTask,
		status::{StatusCell, TaskStatus},
		Task,
	},
};
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// Top-level supervisor: owns the relayers and the task manager, fans in
/// their failures and tears the whole process tree down on the first one.
pub struct Coordinator {
	relayers: RelayerRegistry,
	manager: Arc<TaskManager>,
	status: StatusCell,
	cancel_tx: watch::Sender<bool>,
	err_tx: mpsc::Sender<anyhow::Error>,
	err_rx: Mutex<Option<mpsc::Receiver<anyhow::Error>>>,
}

impl Default for Coordinator {
	fn default() -> Self {
		Self::new()
	}
}

impl Coordinator {
	pub fn new() -> Self {
		let (cancel_tx, _) = watch::channel(false);
		let (err_tx, err_rx) = mpsc::channel(16);
		Coordinator {
			relayers: RelayerRegistry::new(),
			manager: TaskManager::new(),
			status: StatusCell::new(),
			cancel_tx,
			err_tx,
			err_rx: Mutex::new(Some(err_rx)),
		}
	}

	/// The root cancellation signal every component derives from.
	pub fn root_cancel(&self) -> watch::Receiver<bool> {
		self.cancel_tx.subscribe()
	}

	pub fn add_chain_relayer(&mut self, relayer: Arc<dyn ChainRelayerApi>) {
		relayer.set_task_manager(self.manager.clone());
		self.relayers.insert(relayer.chain_id(), relayer);
	}

	pub fn add_task_into_task_pool(&self, task: PoolTask) {
		self.manager.add_task(task);
	}

	pub fn get_relayer(&self, chain_id: u64) -> Option<Arc<dyn ChainRelayerApi>> {
		self.relayers.get(&chain_id).cloned()
	}

	/// Routes a monitor task to the relayer owning its chain.
	pub async fn send_task_to_relayer(&self, task: Arc<dyn MonitorApi>) -> Result<()> {
		let relayer = self
			.relayers
			.get(&task.target_chain_id())
			.ok_or(RoutingError::UnknownChainId(task.target_chain_id()))?;
		relayer.send_monitor_task(task).await
	}

	/// Runs until `stop` is called or a component surfaces an error. On an
	/// error, everything is shut down gracefully and the first error is
	/// returned for the process to exit nonzero.
	pub async fn start(&self) -> Result<()> {
		self.status
			.transition(TaskStatus::NoStart, TaskStatus::Running)
			.map_err(|e| anyhow!("coordinator start rejected: {e}"))?;
		info!("coordinator started");

		let registry = Arc::new(self.relayers.clone());
		let mut err_rx = self
			.err_rx
			.lock()
			.unwrap()
			.take()
			.ok_or_else(|| anyhow!("coordinator started twice"))?;

		let mut handles = Vec::new();
		for relayer in self.relayers.values() {
			let relayer = relayer.clone();
			let err_tx = self.err_tx.clone();
			handles.push(tokio::spawn(async move {
				if let Err(e) = relayer.run().await {
					error!(chain_id = relayer.chain_id(), "relayer failed: {e:#}");
					let _ = err_tx.send(e).await;
				}
			}));
		}

		{
			let manager = self.manager.clone();
			let shutdown_rx = self.cancel_tx.subscribe();
			let err_tx = self.err_tx.clone();
			handles.push(tokio::spawn(async move {
				if let Err(e) = manager.start(registry, shutdown_rx).await {
					error!("task manager failed: {e:#}");
					let _ = err_tx.send(e).await;
				}
			}));
		}

		let mut cancel_rx = self.cancel_tx.subscribe();
		let mut first_error = None;
		while !*cancel_rx.borrow() {
			tokio::select! {
				maybe_err = err_rx.recv() => {
					if let Some(err) = maybe_err {
						error!("component failed, shutting everything down: {err:#}");
						if first_error.is_none() {
							first_error = Some(err);
						}
						self.stop();
					}
				},
				_ = cancel_rx.changed() => break,
			}
		}

		for handle in handles {
			let _ = handle.await;
		}

		self.status.acknowledge_stopped();
		info!("coordinator stopped");

		match first_error {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	pub fn status(&self) -> TaskStatus {
		self.status.get()
	}

	/// Cancels the root context; `start` unwinds and waits for everything.
	pub fn stop(&self) {
		info!("coordinator sending stop signal");
		self.cancel_tx.send_replace(true);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		constants::RETRY_TIMES,
		eth::{event::LogEvent, header::test_utils::*, rpc::ReceiptProofData},
		relayer::MockChainRelayerApi,
		task::{
			schedule::ScheduleTask,
			submit::{new_receive_token_task, new_submit_header_task},
		},
	};
	use ethers::types::{Bytes, TransactionReceipt, H160, H256, U256};
	use std::{
		sync::atomic::{AtomicU32, Ordering},
		time::Duration,
	};

	const SOURCE: u64 = 3333;
	const TARGET: u64 = 5;

	fn idle_relayer(chain_id: u64) -> MockChainRelayerApi {
		let mut relayer = MockChainRelayerApi::new();
		relayer.expect_chain_id().return_const(chain_id);
		relayer.expect_set_task_manager().return_const(());
		relayer.expect_run().returning(|| Ok(()));
		relayer
	}

	#[tokio::test]
	async fn routing_to_unknown_chain_id_is_an_error() {
		use crate::task::monitor::MonitorTask;

		let mut coordinator = Coordinator::new();
		coordinator.add_chain_relayer(Arc::new(idle_relayer(SOURCE)));

		assert!(coordinator.get_relayer(SOURCE).is_some());
		assert!(coordinator.get_relayer(9999).is_none());

		let task: Arc<dyn MonitorApi> = Arc::new(MonitorTask::new_header(9999));
		let err = coordinator.send_task_to_relayer(task).await.unwrap_err();
		assert!(matches!(
			err.downcast_ref::<RoutingError>(),
			Some(RoutingError::UnknownChainId(9999))
		));
	}

	#[tokio::test]
	async fn relayer_failure_shuts_the_coordinator_down() {
		let mut failing = MockChainRelayerApi::new();
		failing.expect_chain_id().return_const(SOURCE);
		failing.expect_set_task_manager().return_const(());
		failing.expect_run().returning(|| Err(anyhow!("ws endpoint unreachable")));

		let mut coordinator = Coordinator::new();
		coordinator.add_chain_relayer(Arc::new(failing));
		coordinator.add_chain_relayer(Arc::new(idle_relayer(TARGET)));

		let err = coordinator.start().await.unwrap_err();
		assert!(err.to_string().contains("unreachable"));
		assert_eq!(coordinator.status(), TaskStatus::Stopped);
	}

	#[tokio::test]
	async fn double_start_is_rejected() {
		let coordinator = Coordinator::new();
		coordinator.stop();
		coordinator.start().await.unwrap();
		assert!(coordinator.start().await.is_err());
	}

	/// Scenario: stop the coordinator while logs are mid-flight. All tasks
	/// must reach Stopped in bounded time and no submission may happen
	/// after the stop.
	#[tokio::test(start_paused = true)]
	async fn graceful_shutdown_with_logs_in_flight() {
		let submissions = Arc::new(AtomicU32::new(0));

		let mut source = MockChainRelayerApi::new();
		source.expect_chain_id().return_const(SOURCE);
		source.expect_set_task_manager().return_const(());
		source.expect_run().returning(|| Ok(()));
		source
			.expect_block_header()
			.returning(|number| Ok(test_header(number, Some(test_commit(number)))));
		source.expect_pack_header().returning(crate::eth::header::pack_epoch_header);
		source.expect_receipt_proof().returning(|_| {
			Ok(ReceiptProofData {
				value: vec![0xaa].into(),
				key: vec![0xbb].into(),
				path: vec![0xcc].into(),
			})
		});

		let mut target = MockChainRelayerApi::new();
		target.expect_chain_id().return_const(TARGET);
		target.expect_set_task_manager().return_const(());
		target.expect_run().returning(|| Ok(()));
		target.expect_is_header_exist_at_light_client().returning(|_| Ok(false));
		target
			.expect_build_and_sign_tx()
			.returning(|_, _, _, _| Ok(Bytes::from(vec![0xf8])));
		{
			let submissions = submissions.clone();
			target.expect_submit_tx().returning(move |_| {
				submissions.fetch_add(1, Ordering::SeqCst);
				Ok(H256::repeat_byte(0xcc))
			});
		}
		target.expect_transaction_receipt().returning(|_| {
			Ok(Some(TransactionReceipt { block_number: Some(40.into()), ..Default::default() }))
		});
		target.expect_latest_header_number().return_const(1_000u64);

		let mut coordinator = Coordinator::new();
		coordinator.add_chain_relayer(Arc::new(source));
		coordinator.add_chain_relayer(Arc::new(target));

		// Wire the pipeline: schedule feeding the two submit tasks.
		let (log_tx, log_rx) = tokio::sync::mpsc::channel(32);
		let (_header_tx, header_rx) = tokio::sync::mpsc::channel(32);
		let confirmed_tx = Arc::new(watch::channel(0u64).0);

		let (submit_header_task, submit_header_in) = new_submit_header_task(
			SOURCE,
			TARGET,
			H160::repeat_byte(0x1c),
			confirmed_tx.clone(),
			10,
			RETRY_TIMES,
			Duration::from_secs(1),
			coordinator.root_cancel(),
		);
		let (receive_token_task, receive_token_in) = new_receive_token_task(
			SOURCE,
			TARGET,
			H160::repeat_byte(0x05),
			RETRY_TIMES,
			Duration::from_secs(1),
		);

		let schedule = ScheduleTask::new(
			"schedule-w3q-to-eth".to_string(),
			SOURCE,
			TARGET,
			log_rx,
			header_rx,
			confirmed_tx.subscribe(),
			Duration::from_secs(200),
		);
		schedule.bind_submit_header(submit_header_in).unwrap();
		schedule.bind_receive_token(receive_token_in).unwrap();

		coordinator.add_task_into_task_pool(PoolTask::Schedule(schedule.clone()));
		coordinator.add_task_into_task_pool(PoolTask::Submit(submit_header_task.clone()));
		coordinator.add_task_into_task_pool(PoolTask::Submit(receive_token_task.clone()));

		let coordinator = Arc::new(coordinator);
		let run = tokio::spawn({
			let coordinator = coordinator.clone();
			async move { coordinator.start().await }
		});

		for height in 100..110 {
			log_tx
				.send(LogEvent {
					address: Default::default(),
					topics: vec![],
					data: vec![],
					block_number: height,
					tx_hash: H256::repeat_byte(height as u8),
					log_index: U256::from(2),
				})
				.await
				.unwrap();
		}

		// Let some submissions through, then pull the plug mid-flight.
		tokio::time::timeout(Duration::from_secs(60), async {
			while submissions.load(Ordering::SeqCst) == 0 {
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.expect("at least one submission before the stop");

		coordinator.stop();
		run.await.unwrap().unwrap();

		assert_eq!(coordinator.status(), TaskStatus::Stopped);
		assert_eq!(schedule.status(), TaskStatus::Stopped);
		assert_eq!(submit_header_task.status(), TaskStatus::Stopped);
		assert_eq!(receive_token_task.status(), TaskStatus::Stopped);

		// Nothing is submitted after the shutdown acknowledgement.
		let submitted_at_stop = submissions.load(Ordering::SeqCst);
		tokio::time::sleep(Duration::from_secs(5)).await;
		assert_eq!(submissions.load(Ordering::SeqCst), submitted_at_stop);
	}
}

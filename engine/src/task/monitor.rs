use crate::{
	constants::{BLOCK_INTERVAL, RESUBSCRIBE_ATTEMPTS},
	eth::{event::LogEvent, header::ChainHeader, rpc::Subscription},
	relayer::ChainRelayerApi,
	task::{
		status::{StatusCell, TaskStateError, TaskStatus},
		Task, TaskType,
	},
};
use anyhow::{anyhow, Result};
use ethers::types::{H160, H256};
use futures::{future::BoxFuture, FutureExt};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Establishes the underlying subscription through the owning relayer.
/// Also the recovery path: the task re-runs it when the subscription dies.
pub type MonitorFn<T> = Box<
	dyn Fn(Arc<dyn ChainRelayerApi>) -> BoxFuture<'static, Result<(Subscription, mpsc::Receiver<T>)>>
		+ Send
		+ Sync,
>;

/// Object-safe view of a monitor task, independent of its payload type.
/// This is what travels through a relayer's inbox.
#[async_trait::async_trait]
pub trait MonitorApi: Task {
	/// Runs the monitor fn against the owning relayer, storing the live
	/// subscription for `start_monitor`. Must be called before the task is
	/// started, by the relayer that received it.
	async fn exec_monitor_fn(&self, relayer: Arc<dyn ChainRelayerApi>) -> Result<()>;

	/// The task's event loop. Returns an error only when the subscription
	/// could not be recovered; the caller decides what that means.
	async fn start_monitor(&self) -> Result<()>;
}

struct Established<T> {
	subscription: Subscription,
	receiver: mpsc::Receiver<T>,
	relayer: Arc<dyn ChainRelayerApi>,
}

/// A long-lived subscription forwarder. `MonitorTask<LogEvent>` watches
/// contract logs, `MonitorTask<ChainHeader>` watches new heads; everything
/// but the subscription call is shared.
pub struct MonitorTask<T> {
	task_type: TaskType,
	name: String,
	target_chain_id: u64,
	monitor_fn: MonitorFn<T>,
	send_data: Mutex<Option<mpsc::Sender<T>>>,
	established: Mutex<Option<Established<T>>>,
	status: StatusCell,
	cancel_tx: watch::Sender<bool>,
}

pub type MonitorEventTask = MonitorTask<LogEvent>;
pub type MonitorHeaderTask = MonitorTask<ChainHeader>;

enum Recovered<T> {
	Established(Subscription, mpsc::Receiver<T>),
	Cancelled,
	Failed(anyhow::Error),
}

impl<T: Send + 'static> MonitorTask<T> {
	fn new(task_type: TaskType, name: String, target_chain_id: u64, monitor_fn: MonitorFn<T>) -> Self {
		let (cancel_tx, _) = watch::channel(false);
		MonitorTask {
			task_type,
			name,
			target_chain_id,
			monitor_fn,
			send_data: Mutex::new(None),
			established: Mutex::new(None),
			status: StatusCell::new(),
			cancel_tx,
		}
	}

	/// Binds the single downstream consumer. One-shot: a second bind fails,
	/// and binding after start fails.
	pub fn subscribe_data(&self, sender: mpsc::Sender<T>) -> Result<()> {
		if self.status.get() != TaskStatus::NoStart {
			return Err(anyhow!("{} cannot be subscribed after start", self.name));
		}
		let mut send_data = self.send_data.lock().unwrap();
		if send_data.is_some() {
			return Err(anyhow!("{} has already been subscribed", self.name));
		}
		*send_data = Some(sender);
		Ok(())
	}

	async fn resubscribe(
		&self,
		relayer: &Arc<dyn ChainRelayerApi>,
		cancel_rx: &mut watch::Receiver<bool>,
	) -> Recovered<T> {
		for attempt in 1..=RESUBSCRIBE_ATTEMPTS {
			match (self.monitor_fn)(relayer.clone()).await {
				Ok((subscription, receiver)) => {
					info!(
						task = %self.name,
						chain_id = self.target_chain_id,
						"re-established subscription"
					);
					return Recovered::Established(subscription, receiver)
				},
				Err(e) => {
					warn!(
						task = %self.name,
						chain_id = self.target_chain_id,
						attempt,
						"failed to re-establish subscription: {e:#}"
					);
					if attempt < RESUBSCRIBE_ATTEMPTS {
						tokio::select! {
							_ = cancel_rx.changed() => return Recovered::Cancelled,
							_ = tokio::time::sleep(BLOCK_INTERVAL) => {},
						}
					}
				},
			}
		}
		Recovered::Failed(anyhow!(
			"{} could not re-establish its subscription after {RESUBSCRIBE_ATTEMPTS} attempts",
			self.name
		))
	}
}

impl MonitorTask<LogEvent> {
	/// Watches `(contract, topic0)` logs on the given chain.
	pub fn new_event(
		target_chain_id: u64,
		contract_address: H160,
		event_name: &str,
		event_topic: H256,
	) -> Self {
		let monitor_fn: MonitorFn<LogEvent> = Box::new(move |relayer| {
			async move { relayer.subscribe_event(contract_address, event_topic).await }.boxed()
		});
		Self::new(
			TaskType::MonitorEvent,
			format!("monitor-event:{event_name}"),
			target_chain_id,
			monitor_fn,
		)
	}
}

impl MonitorTask<ChainHeader> {
	/// Watches the new-head stream of the given chain.
	pub fn new_header(target_chain_id: u64) -> Self {
		let monitor_fn: MonitorFn<ChainHeader> =
			Box::new(move |relayer| async move { relayer.subscribe_latest_header().await }.boxed());
		Self::new(TaskType::MonitorHeader, "monitor-header".to_string(), target_chain_id, monitor_fn)
	}
}

impl<T: Send + 'static> Task for MonitorTask<T> {
	fn task_type(&self) -> TaskType {
		self.task_type
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
		info!(task = %self.name, chain_id = self.target_chain_id, "stopping monitor task");
		self.cancel_tx.send_replace(true);
		Ok(())
	}
}

#[async_trait::async_trait]
impl<T: Send + 'static> MonitorApi for MonitorTask<T> {
	async fn exec_monitor_fn(&self, relayer: Arc<dyn ChainRelayerApi>) -> Result<()> {
		if self.status.get() != TaskStatus::NoStart {
			return Err(anyhow!(
				"{} cannot establish a subscription with status [{}]",
				self.name,
				self.status.get()
			));
		}
		let (subscription, receiver) = (self.monitor_fn)(relayer.clone()).await?;
		let mut established = self.established.lock().unwrap();
		if established.is_some() {
			return Err(anyhow!("{} already has a live subscription", self.name));
		}
		*established = Some(Established { subscription, receiver, relayer });
		Ok(())
	}

	async fn start_monitor(&self) -> Result<()> {
		// Subscribe before going Running: a stop() racing this start can
		// only fire after the CAS, and must not be missed.
		let mut cancel_rx = self.cancel_tx.subscribe();
		self.status
			.transition(TaskStatus::NoStart, TaskStatus::Running)
			.map_err(|e| anyhow!("{} start rejected: {e}", self.name))?;

		let Established { mut subscription, mut receiver, relayer } = self
			.established
			.lock()
			.unwrap()
			.take()
			.ok_or_else(|| anyhow!("{} started without an established subscription", self.name))?;

		let sender = self.send_data.lock().unwrap().clone();

		info!(task = %self.name, chain_id = self.target_chain_id, "monitor task running");

		loop {
			let recovered = tokio::select! {
				_ = cancel_rx.changed() => {
					subscription.unsubscribe();
					self.status.acknowledge_stopped();
					info!(task = %self.name, chain_id = self.target_chain_id, "monitor task stopped");
					return Ok(())
				},
				item = receiver.recv() => match item {
					Some(data) => {
						if let Some(sender) = &sender {
							tokio::select! {
								result = sender.send(data) =>
									if result.is_err() {
										warn!(
											task = %self.name,
											chain_id = self.target_chain_id,
											"downstream consumer is gone, dropping item"
										);
									},
								_ = cancel_rx.changed() => {
									subscription.unsubscribe();
									self.status.acknowledge_stopped();
									return Ok(())
								},
							}
						}
						continue
					},
					// The pump only closes the data channel when the
					// subscription itself is gone.
					None => self.resubscribe(&relayer, &mut cancel_rx).await,
				},
				err = subscription.err() => {
					warn!(
						task = %self.name,
						chain_id = self.target_chain_id,
						"subscription failed: {err:#}"
					);
					self.resubscribe(&relayer, &mut cancel_rx).await
				},
			};

			match recovered {
				Recovered::Established(new_subscription, new_receiver) => {
					subscription = new_subscription;
					receiver = new_receiver;
				},
				Recovered::Cancelled => {
					self.status.acknowledge_stopped();
					return Ok(())
				},
				Recovered::Failed(e) => {
					self.status.acknowledge_stopped();
					return Err(e)
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::relayer::MockChainRelayerApi;
	use std::sync::atomic::{AtomicUsize, Ordering};

	/// A monitor task whose "subscriptions" are channels handed out by the
	/// test, one per (re)subscription attempt.
	fn test_task(
		feeds: Vec<(Subscription, mpsc::Receiver<u64>)>,
	) -> (Arc<MonitorTask<u64>>, Arc<AtomicUsize>) {
		let feeds = Mutex::new(feeds.into_iter());
		let calls = Arc::new(AtomicUsize::new(0));
		let calls_in_fn = calls.clone();
		let monitor_fn: MonitorFn<u64> = Box::new(move |_relayer| {
			calls_in_fn.fetch_add(1, Ordering::SeqCst);
			let next = feeds.lock().unwrap().next();
			async move { next.ok_or_else(|| anyhow!("no subscription available")) }.boxed()
		});
		(
			Arc::new(MonitorTask::new(TaskType::MonitorEvent, "monitor-test".to_string(), 3333, monitor_fn)),
			calls,
		)
	}

	fn mock_relayer() -> Arc<dyn ChainRelayerApi> {
		Arc::new(MockChainRelayerApi::new())
	}

	async fn wait_for_status(task: &MonitorTask<u64>, status: TaskStatus) {
		tokio::time::timeout(std::time::Duration::from_secs(1), async {
			while task.status() != status {
				tokio::time::sleep(std::time::Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap_or_else(|_| panic!("task never reached {status}, still {}", task.status()));
	}

	#[tokio::test]
	async fn second_data_subscription_fails() {
		let (sub, _err, _stop) = Subscription::test_handles();
		let (_feed_tx, feed_rx) = mpsc::channel(4);
		let (task, _) = test_task(vec![(sub, feed_rx)]);

		let (down_tx, _down_rx) = mpsc::channel(4);
		task.subscribe_data(down_tx.clone()).unwrap();
		assert!(task.subscribe_data(down_tx).is_err());
	}

	#[tokio::test]
	async fn forwards_items_in_order_and_stops_cleanly() {
		let (sub, _err, _stop) = Subscription::test_handles();
		let (feed_tx, feed_rx) = mpsc::channel(4);
		let (task, _) = test_task(vec![(sub, feed_rx)]);

		let (down_tx, mut down_rx) = mpsc::channel(4);
		task.subscribe_data(down_tx).unwrap();
		task.exec_monitor_fn(mock_relayer()).await.unwrap();

		let handle = tokio::spawn({
			let task = task.clone();
			async move { task.start_monitor().await }
		});

		feed_tx.send(1).await.unwrap();
		feed_tx.send(2).await.unwrap();
		assert_eq!(down_rx.recv().await, Some(1));
		assert_eq!(down_rx.recv().await, Some(2));

		task.stop().unwrap();
		wait_for_status(&task, TaskStatus::Stopped).await;
		handle.await.unwrap().unwrap();

		// Items arriving after Stopped are never forwarded.
		let _ = feed_tx.send(3).await;
		assert!(down_rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn double_start_is_rejected() {
		let (sub, _err, _stop) = Subscription::test_handles();
		let (_feed_tx, feed_rx) = mpsc::channel(4);
		let (task, _) = test_task(vec![(sub, feed_rx)]);
		task.exec_monitor_fn(mock_relayer()).await.unwrap();

		let handle = tokio::spawn({
			let task = task.clone();
			async move { task.start_monitor().await }
		});
		wait_for_status(&task, TaskStatus::Running).await;
		assert!(task.start_monitor().await.is_err());

		task.stop().unwrap();
		handle.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn recovers_from_subscription_error_and_keeps_forwarding() {
		let (sub_a, err_a, _stop_a) = Subscription::test_handles();
		let (_feed_a_tx, feed_a_rx) = mpsc::channel(4);
		let (sub_b, _err_b, _stop_b) = Subscription::test_handles();
		let (feed_b_tx, feed_b_rx) = mpsc::channel(4);

		let (task, calls) = test_task(vec![(sub_a, feed_a_rx), (sub_b, feed_b_rx)]);
		let (down_tx, mut down_rx) = mpsc::channel(4);
		task.subscribe_data(down_tx).unwrap();
		task.exec_monitor_fn(mock_relayer()).await.unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		let handle = tokio::spawn({
			let task = task.clone();
			async move { task.start_monitor().await }
		});

		// Drop the first subscription; the task must re-subscribe and keep
		// delivering from the replacement feed.
		err_a.send(anyhow!("ws dropped")).await.unwrap();
		feed_b_tx.send(7).await.unwrap();
		assert_eq!(down_rx.recv().await, Some(7));
		assert_eq!(calls.load(Ordering::SeqCst), 2);

		task.stop().unwrap();
		handle.await.unwrap().unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn unrecoverable_subscription_surfaces_an_error() {
		let (sub, err, _stop) = Subscription::test_handles();
		let (_feed_tx, feed_rx) = mpsc::channel(4);
		// Only one feed available: every resubscription attempt fails.
		let (task, _) = test_task(vec![(sub, feed_rx)]);
		task.exec_monitor_fn(mock_relayer()).await.unwrap();

		let handle = tokio::spawn({
			let task = task.clone();
			async move { task.start_monitor().await }
		});

		err.send(anyhow!("ws dropped")).await.unwrap();
		assert!(handle.await.unwrap().is_err());
		assert_eq!(task.status(), TaskStatus::Stopped);
	}
}

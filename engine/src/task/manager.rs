use crate::{
	common::make_periodic_tick,
	constants::{STOPPED_POLL_INTERVAL, STOP_DRAIN_TIMEOUT},
	relayer::{RelayerRegistry, RoutingError},
	task::{
		pool::{PoolTask, TaskPool},
		status::{StatusCell, TaskStatus},
		Task,
	},
};
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Launches, supervises and tears down the task pool. Startup order is
/// schedule, monitor, submit; shutdown stops submit, then schedule, then
/// monitor tasks and waits for each group to drain.
pub struct TaskManager {
	pool: Mutex<TaskPool>,
	status: StatusCell,
}

impl Default for TaskManager {
	fn default() -> Self {
		TaskManager { pool: Mutex::new(TaskPool::new()), status: StatusCell::new() }
	}
}

impl TaskManager {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn status(&self) -> TaskStatus {
		self.status.get()
	}

	/// Only valid before `start`; the pool is frozen afterwards.
	pub fn add_task(&self, task: PoolTask) {
		debug_assert_eq!(self.status.get(), TaskStatus::NoStart);
		self.pool.lock().unwrap().add(task);
	}

	pub async fn start(
		&self,
		registry: Arc<RelayerRegistry>,
		mut shutdown_rx: watch::Receiver<bool>,
	) -> Result<()> {
		self.status
			.transition(TaskStatus::NoStart, TaskStatus::Running)
			.map_err(|e| anyhow!("task manager start rejected: {e}"))?;
		info!("task manager started");

		let (schedules, monitors, submits) = {
			let pool = self.pool.lock().unwrap();
			(pool.schedule_queue.clone(), pool.monitor_queue.clone(), pool.tx_queue.clone())
		};

		let mut handles = Vec::new();

		for task in &schedules {
			let task = task.clone();
			let registry = registry.clone();
			handles.push(tokio::spawn(async move {
				if let Err(e) = task.start(registry).await {
					error!(task = %task.name(), "schedule task failed: {e:#}");
				}
			}));
		}

		// Monitor tasks are routed to the relayer owning their chain. A
		// missing relayer fails the whole startup.
		for task in &monitors {
			let result = match registry.get(&task.target_chain_id()) {
				Some(relayer) => relayer.send_monitor_task(task.clone()).await,
				None => Err(RoutingError::UnknownChainId(task.target_chain_id()).into()),
			};
			if let Err(e) = result {
				error!(
					task = %task.name(),
					chain_id = task.target_chain_id(),
					"failed to hand monitor task to its relayer: {e:#}"
				);
				self.shutdown(&schedules, &monitors, &submits).await;
				for handle in handles {
					let _ = handle.await;
				}
				self.status.acknowledge_stopped();
				return Err(e)
			}
		}

		for task in &submits {
			let task = task.clone();
			let registry = registry.clone();
			handles.push(tokio::spawn(async move {
				if let Err(e) = task.start(registry).await {
					error!(task = %task.name(), "submit task failed: {e:#}");
				}
			}));
		}

		if !*shutdown_rx.borrow() {
			let _ = shutdown_rx.changed().await;
		}
		info!("task manager received stop signal");

		self.shutdown(&schedules, &monitors, &submits).await;
		for handle in handles {
			let _ = handle.await;
		}

		self.status.acknowledge_stopped();
		info!("task manager stopped");
		Ok(())
	}

	async fn shutdown(
		&self,
		schedules: &[Arc<crate::task::schedule::ScheduleTask>],
		monitors: &[Arc<dyn crate::task::monitor::MonitorApi>],
		submits: &[Arc<dyn crate::task::submit::SubmitApi>],
	) {
		stop_and_drain(submits).await;
		stop_and_drain(schedules).await;
		stop_and_drain(monitors).await;
	}

	/// Stops only the Running monitor tasks bound to the given chain, used
	/// when one relayer fails in isolation.
	pub fn stop_tasks_by_chain_id(&self, chain_id: u64) {
		let pool = self.pool.lock().unwrap();
		for task in &pool.monitor_queue {
			if task.target_chain_id() == chain_id && task.status() == TaskStatus::Running {
				if let Err(e) = task.stop() {
					warn!(task = %task.name(), chain_id, "failed to stop monitor task: {e}");
				}
			}
		}
	}
}

/// Signals stop to every Running task in the slice, then polls until the
/// group has drained (bounded by `STOP_DRAIN_TIMEOUT`).
async fn stop_and_drain<T: Task + ?Sized>(tasks: &[Arc<T>]) {
	for task in tasks {
		if task.status() == TaskStatus::Running {
			if let Err(e) = task.stop() {
				warn!(task = %task.name(), "failed to stop task: {e}");
			}
		}
	}

	let deadline = tokio::time::Instant::now() + STOP_DRAIN_TIMEOUT;
	let mut tick = make_periodic_tick(STOPPED_POLL_INTERVAL, true);
	loop {
		if tasks
			.iter()
			.all(|task| matches!(task.status(), TaskStatus::Stopped | TaskStatus::NoStart))
		{
			return
		}
		if tokio::time::Instant::now() >= deadline {
			for task in tasks {
				if !matches!(task.status(), TaskStatus::Stopped | TaskStatus::NoStart) {
					warn!(task = %task.name(), status = %task.status(), "task did not drain in time");
				}
			}
			return
		}
		tick.tick().await;
	}
}

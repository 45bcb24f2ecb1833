use crate::task::{monitor::MonitorApi, schedule::ScheduleTask, submit::SubmitApi};
use std::sync::Arc;

/// A task on its way into the pool, tagged by kind so the coordinator can
/// route it to the right queue.
pub enum PoolTask {
	Monitor(Arc<dyn MonitorApi>),
	Submit(Arc<dyn SubmitApi>),
	Schedule(Arc<ScheduleTask>),
}

/// Three ordered queues. Order is preserved so that startup is
/// deterministic and shutdown deterministically reversed.
#[derive(Default)]
pub struct TaskPool {
	pub(crate) monitor_queue: Vec<Arc<dyn MonitorApi>>,
	pub(crate) tx_queue: Vec<Arc<dyn SubmitApi>>,
	pub(crate) schedule_queue: Vec<Arc<ScheduleTask>>,
}

impl TaskPool {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_monitor_task(&mut self, task: Arc<dyn MonitorApi>) -> &mut Self {
		self.monitor_queue.push(task);
		self
	}

	pub fn add_submit_task(&mut self, task: Arc<dyn SubmitApi>) -> &mut Self {
		self.tx_queue.push(task);
		self
	}

	pub fn add_schedule_task(&mut self, task: Arc<ScheduleTask>) -> &mut Self {
		self.schedule_queue.push(task);
		self
	}

	pub fn add(&mut self, task: PoolTask) -> &mut Self {
		match task {
			PoolTask::Monitor(task) => self.add_monitor_task(task),
			PoolTask::Submit(task) => self.add_submit_task(task),
			PoolTask::Schedule(task) => self.add_schedule_task(task),
		}
	}
}

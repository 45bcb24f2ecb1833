pub mod manager;
pub mod monitor;
pub mod pool;
pub mod schedule;
pub mod status;
pub mod submit;

use self::status::{TaskStateError, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
	MonitorEvent,
	MonitorHeader,
	SubmitTx,
	Schedule,
}

impl std::fmt::Display for TaskType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			TaskType::MonitorEvent => "MonitorEvent",
			TaskType::MonitorHeader => "MonitorHeader",
			TaskType::SubmitTx => "SubmitTx",
			TaskType::Schedule => "Schedule",
		};
		write!(f, "{s}")
	}
}

/// Common surface of the four task kinds. Starting is kind-specific (the
/// pool launches each kind differently), stopping is not.
pub trait Task: Send + Sync {
	fn task_type(&self) -> TaskType;

	fn name(&self) -> &str;

	fn status(&self) -> TaskStatus;

	/// The chain this task is bound to. For monitor tasks this is the chain
	/// whose relayer must run the subscription.
	fn target_chain_id(&self) -> u64;

	/// Signals the task to stop. Fails when the task is not `Running`;
	/// the event loop acknowledges by moving to `Stopped` once drained.
	fn stop(&self) -> Result<(), TaskStateError>;
}

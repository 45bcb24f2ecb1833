use std::sync::atomic::{AtomicU8, Ordering};

/// Shared lifecycle of every long-lived component: tasks, relayers, the
/// manager and the coordinator. Transitions are one-way:
///
/// ```text
/// NoStart --start--> Running --stop--> Stopping --drain--> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
	NoStart = 0,
	Running = 1,
	Stopping = 2,
	Stopped = 3,
}

impl TaskStatus {
	fn from_u8(raw: u8) -> Self {
		match raw {
			0 => TaskStatus::NoStart,
			1 => TaskStatus::Running,
			2 => TaskStatus::Stopping,
			_ => TaskStatus::Stopped,
		}
	}
}

impl std::fmt::Display for TaskStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			TaskStatus::NoStart => "NoStart",
			TaskStatus::Running => "Running",
			TaskStatus::Stopping => "Stopping",
			TaskStatus::Stopped => "Stopped",
		};
		write!(f, "{s}")
	}
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid lifecycle transition from {actual} (expected {expected})")]
pub struct TaskStateError {
	pub expected: TaskStatus,
	pub actual: TaskStatus,
}

/// Atomic status cell. All transitions go through compare-and-set so that a
/// component can never be started or stopped twice.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl Default for StatusCell {
	fn default() -> Self {
		Self::new()
	}
}

impl StatusCell {
	pub fn new() -> Self {
		StatusCell(AtomicU8::new(TaskStatus::NoStart as u8))
	}

	pub fn get(&self) -> TaskStatus {
		TaskStatus::from_u8(self.0.load(Ordering::SeqCst))
	}

	/// Transitions `from` -> `to`, failing with the observed status if the
	/// cell was not in `from`.
	pub fn transition(&self, from: TaskStatus, to: TaskStatus) -> Result<(), TaskStateError> {
		self.0
			.compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
			.map(|_| ())
			.map_err(|actual| TaskStateError {
				expected: from,
				actual: TaskStatus::from_u8(actual),
			})
	}

	/// Unconditional store, only used by an event loop acknowledging its own
	/// shutdown (the loop is the sole writer at that point).
	pub fn set(&self, status: TaskStatus) {
		self.0.store(status as u8, Ordering::SeqCst);
	}

	/// Terminal acknowledgement from the event loop itself, passing through
	/// `Stopping` first. Observers always see the full lifecycle sequence.
	pub fn acknowledge_stopped(&self) {
		let _ = self.transition(TaskStatus::Running, TaskStatus::Stopping);
		self.set(TaskStatus::Stopped);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn transitions_follow_the_lifecycle_order() {
		let cell = StatusCell::new();
		assert_eq!(cell.get(), TaskStatus::NoStart);

		cell.transition(TaskStatus::NoStart, TaskStatus::Running).unwrap();
		cell.transition(TaskStatus::Running, TaskStatus::Stopping).unwrap();
		cell.transition(TaskStatus::Stopping, TaskStatus::Stopped).unwrap();
		assert_eq!(cell.get(), TaskStatus::Stopped);
	}

	#[test]
	fn double_start_is_rejected() {
		let cell = StatusCell::new();
		cell.transition(TaskStatus::NoStart, TaskStatus::Running).unwrap();

		let err = cell.transition(TaskStatus::NoStart, TaskStatus::Running).unwrap_err();
		assert_eq!(err.expected, TaskStatus::NoStart);
		assert_eq!(err.actual, TaskStatus::Running);
	}

	#[test]
	fn stop_from_terminal_state_is_an_error_not_a_panic() {
		let cell = StatusCell::new();
		cell.set(TaskStatus::Stopped);
		assert!(cell.transition(TaskStatus::Running, TaskStatus::Stopping).is_err());
	}
}

use serde::{Deserialize, Serialize};

/// Lifecycle of a [`Proc`](crate::Proc).
///
/// `Unstarted -> Running -> {Finished, Panicked}`. Nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum State {
	/// Constructed, execution not begun.
	Unstarted = 0,
	Running = 1,
	/// Exited and we observed a verified exit code (which may still be nonzero).
	Finished = 2,
	/// Monitoring failed. The process may or may not still be running and its
	/// exit code is not known.
	Panicked = 3,
}

impl State {
	pub fn is_running(self) -> bool {
		self == State::Running
	}

	pub fn is_started(self) -> bool {
		matches!(self, State::Running | State::Finished | State::Panicked)
	}

	pub fn is_done(self) -> bool {
		matches!(self, State::Finished | State::Panicked)
	}

	pub fn is_finished_gracefully(self) -> bool {
		self == State::Finished
	}

	pub(crate) fn from_u8(raw: u8) -> State {
		match raw {
			0 => State::Unstarted,
			1 => State::Running,
			2 => State::Finished,
			_ => State::Panicked,
		}
	}
}

impl std::fmt::Display for State {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			State::Unstarted => "unstarted",
			State::Running => "running",
			State::Finished => "finished",
			State::Panicked => "panicked",
		};
		f.write_str(name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn queries() {
		assert!(!State::Unstarted.is_started());
		assert!(!State::Unstarted.is_done());
		assert!(State::Running.is_started());
		assert!(State::Running.is_running());
		assert!(!State::Running.is_done());
		assert!(State::Finished.is_done());
		assert!(State::Finished.is_finished_gracefully());
		assert!(State::Panicked.is_done());
		assert!(!State::Panicked.is_finished_gracefully());
		assert!(!State::Panicked.is_running());
	}

	#[test]
	fn serializes_lowercase() {
		assert_eq!(serde_json::to_string(&State::Panicked).unwrap(), "\"panicked\"");
		assert_eq!(State::Finished.to_string(), "finished");
	}
}

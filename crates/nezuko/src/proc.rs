//! The contract for observing and manipulating an in-flight process.
//!
//! Every method on [`Proc`] is safe to call repeatedly, in any order, from any
//! number of tasks. Waiting on a proc that hasn't started yet just waits
//! longer; waiting on one that has finished returns immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::sync::watch;

use crate::error::{MonitorError, Result};
use crate::state::State;

/// Exit code reported when none is known: before completion, after a bounded
/// wait runs out, or when monitoring failed.
pub const UNDEFINED_EXIT: i32 = -1;

/// Pid reported before a proc has started.
pub const NO_PID: i32 = -1;

pub type ProcHandle = Arc<dyn Proc>;

/// Called once when a proc reaches a terminal state.
///
/// Listeners run on the monitor's thread after the exit code is final but
/// before any `wait` returns. They should be quick and must not block on the
/// completion of the proc that is invoking them.
pub type ExitListener = Box<dyn FnOnce(&dyn Proc) + Send + 'static>;

#[async_trait]
pub trait Proc: Send + Sync {
	fn state(&self) -> State;

	/// OS pid, [`NO_PID`] before start, or 0 for implementations without pids.
	fn pid(&self) -> i32;

	/// The recorded exit code without waiting; [`UNDEFINED_EXIT`] until known.
	fn exit_code_now(&self) -> i32;

	/// Cause of a `Panicked` state.
	fn error(&self) -> Option<MonitorError>;

	fn completion(&self) -> Completion;

	/// Registers `callback` to run at completion. If the proc is already done,
	/// `callback` runs right away on the calling thread.
	fn add_exit_listener(&self, callback: ExitListener);

	fn kill(&self) -> Result<()> {
		self.signal(Signal::SIGKILL)
	}

	/// Best-effort signal delivery. Never changes state by itself; the wait
	/// loop observes whatever the signal causes.
	fn signal(&self, signal: Signal) -> Result<()>;

	async fn wait(&self) {
		self.completion().wait().await
	}

	/// Returns true if the proc completed within `timeout`.
	async fn wait_for(&self, timeout: Duration) -> bool {
		self.completion().wait_for(timeout).await
	}

	async fn exit_code(&self) -> i32 {
		self.wait().await;
		self.exit_code_now()
	}

	async fn exit_code_within(&self, timeout: Duration) -> i32 {
		if self.wait_for(timeout).await {
			self.exit_code_now()
		} else {
			UNDEFINED_EXIT
		}
	}
}

/// Broadcast gate that opens once, when a proc reaches a terminal state.
///
/// Any number of clones can wait on it concurrently; all of them are released
/// together.
///
/// The gate also releases its waiters if the [`Monitor`](crate::Monitor)
/// behind it is dropped without finalizing. That only happens when a custom
/// [`Proc`] discards its monitor early, and such a proc still reports a
/// non-terminal [`State`] afterwards. Check [`is_done`](Completion::is_done)
/// or the proc's state when that distinction matters.
#[derive(Debug, Clone)]
pub struct Completion {
	rx: watch::Receiver<bool>,
}

impl Completion {
	pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
		Self { rx }
	}

	pub fn is_done(&self) -> bool {
		*self.rx.borrow()
	}

	/// Resolves once the gate opens, or once its monitor is dropped.
	pub async fn wait(&self) {
		let mut rx = self.rx.clone();
		// Err means the sender is gone: nothing can open the gate any more.
		let _ = rx.wait_for(|done| *done).await;
	}

	pub async fn wait_for(&self, timeout: Duration) -> bool {
		tokio::time::timeout(timeout, self.wait()).await.is_ok() && self.is_done()
	}
}

//! State machine shared by [`Proc`] implementations.
//!
//! All writes happen under one mutex. `state` is additionally readable without
//! the lock: every transition stores it last, after the fields it vouches for,
//! so a reader that sees a terminal state also sees the final exit code and
//! error. The completion gate opens after that, and after the listeners ran.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::error::MonitorError;
use crate::proc::{Completion, ExitListener, Proc, UNDEFINED_EXIT};
use crate::state::State;

pub struct Monitor {
	inner: Mutex<Inner>,
	state: AtomicU8,
	done: watch::Sender<bool>,
}

struct Inner {
	exit_code: i32,
	error: Option<MonitorError>,
	listeners: Vec<ExitListener>,
}

impl Monitor {
	pub fn new() -> Self {
		let (done, _) = watch::channel(false);
		Self {
			inner: Mutex::new(Inner {
				exit_code: UNDEFINED_EXIT,
				error: None,
				listeners: Vec::new(),
			}),
			state: AtomicU8::new(State::Unstarted as u8),
			done,
		}
	}

	pub fn state(&self) -> State {
		State::from_u8(self.state.load(Ordering::SeqCst))
	}

	/// `Unstarted -> Running`. Returns false (and does nothing) if already started.
	pub fn begin(&self) -> bool {
		let _inner = self.lock();
		if self.state().is_started() {
			return false;
		}
		self.state.store(State::Running as u8, Ordering::SeqCst);
		true
	}

	pub fn exit_code(&self) -> i32 {
		self.lock().exit_code
	}

	pub fn error(&self) -> Option<MonitorError> {
		self.lock().error.clone()
	}

	pub fn completion(&self) -> Completion {
		Completion::new(self.done.subscribe())
	}

	/// Moves a running monitor to its terminal state.
	///
	/// `Ok(code)` finishes with a verified exit code, `Err` panics with the
	/// cause. Calls on a monitor that isn't `Running` are ignored, so racing
	/// finalizers resolve to exactly one winner.
	pub fn finalize(&self, proc: &dyn Proc, outcome: Result<i32, MonitorError>) {
		let listeners = {
			let mut inner = self.lock();
			if !self.state().is_running() {
				return;
			}
			let terminal = match outcome {
				Ok(code) => {
					inner.exit_code = code;
					State::Finished
				}
				Err(err) => {
					inner.error = Some(err);
					State::Panicked
				}
			};
			let listeners = std::mem::take(&mut inner.listeners);
			self.state.store(terminal as u8, Ordering::SeqCst);
			listeners
		};

		tracing::debug!(
			pid = proc.pid(),
			state = %self.state(),
			exit_code = self.exit_code(),
			listeners = listeners.len(),
			"proc finalized"
		);

		for listener in listeners {
			invoke(listener, proc);
		}

		self.done.send_replace(true);
	}

	/// Queues `listener` for finalize, or runs it now if already terminal.
	pub fn add_listener(&self, proc: &dyn Proc, listener: ExitListener) {
		{
			let mut inner = self.lock();
			if !self.state().is_done() {
				inner.listeners.push(listener);
				return;
			}
		}
		invoke(listener, proc);
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl Default for Monitor {
	fn default() -> Self {
		Self::new()
	}
}

fn invoke(listener: ExitListener, proc: &dyn Proc) {
	if panic::catch_unwind(AssertUnwindSafe(|| listener(proc))).is_err() {
		tracing::error!(pid = proc.pid(), "exit listener panicked");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::Result;
	use nix::errno::Errno;
	use nix::sys::signal::Signal;
	use std::sync::atomic::AtomicUsize;
	use std::sync::{Arc, Mutex as StdMutex};
	use std::time::Duration;

	struct Bare {
		monitor: Monitor,
	}

	impl Bare {
		fn new() -> Arc<Self> {
			Arc::new(Self {
				monitor: Monitor::new(),
			})
		}
	}

	impl Proc for Bare {
		fn state(&self) -> State {
			self.monitor.state()
		}
		fn pid(&self) -> i32 {
			0
		}
		fn exit_code_now(&self) -> i32 {
			self.monitor.exit_code()
		}
		fn error(&self) -> Option<MonitorError> {
			self.monitor.error()
		}
		fn completion(&self) -> Completion {
			self.monitor.completion()
		}
		fn add_exit_listener(&self, callback: ExitListener) {
			self.monitor.add_listener(self, callback)
		}
		fn signal(&self, _signal: Signal) -> Result<()> {
			Ok(())
		}
	}

	#[test]
	fn begin_is_idempotent() {
		let m = Monitor::new();
		assert_eq!(m.state(), State::Unstarted);
		assert!(m.begin());
		assert!(!m.begin());
		assert_eq!(m.state(), State::Running);
	}

	#[test]
	fn finalize_before_begin_is_ignored() {
		let p = Bare::new();
		p.monitor.finalize(p.as_ref(), Ok(3));
		assert_eq!(p.state(), State::Unstarted);
		assert_eq!(p.exit_code_now(), UNDEFINED_EXIT);
		assert!(!p.completion().is_done());
	}

	#[test]
	fn second_finalize_is_ignored() {
		let p = Bare::new();
		p.monitor.begin();
		p.monitor.finalize(p.as_ref(), Ok(3));
		p.monitor.finalize(p.as_ref(), Err(MonitorError::from(Errno::ECHILD)));
		assert_eq!(p.state(), State::Finished);
		assert_eq!(p.exit_code_now(), 3);
		assert!(p.error().is_none());
	}

	#[test]
	fn error_outcome_panics_with_undefined_code() {
		let p = Bare::new();
		p.monitor.begin();
		p.monitor.finalize(p.as_ref(), Err(MonitorError::from(Errno::ECHILD)));
		assert_eq!(p.state(), State::Panicked);
		assert_eq!(p.exit_code_now(), UNDEFINED_EXIT);
		assert!(p.error().is_some());
	}

	#[test]
	fn listeners_run_once_in_order() {
		let p = Bare::new();
		let seen = Arc::new(StdMutex::new(Vec::new()));
		p.monitor.begin();
		for i in 0..3 {
			let seen = Arc::clone(&seen);
			p.add_exit_listener(Box::new(move |proc| {
				seen.lock().unwrap().push((i, proc.state(), proc.exit_code_now()));
			}));
		}
		p.monitor.finalize(p.as_ref(), Ok(7));
		p.monitor.finalize(p.as_ref(), Ok(8));
		assert_eq!(
			*seen.lock().unwrap(),
			vec![
				(0, State::Finished, 7),
				(1, State::Finished, 7),
				(2, State::Finished, 7)
			]
		);
	}

	#[test]
	fn late_listener_runs_immediately() {
		let p = Bare::new();
		p.monitor.begin();
		p.monitor.finalize(p.as_ref(), Ok(0));
		let calls = Arc::new(AtomicUsize::new(0));
		let c = Arc::clone(&calls);
		p.add_exit_listener(Box::new(move |_| {
			c.fetch_add(1, Ordering::SeqCst);
		}));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn panicking_listener_does_not_stop_the_rest() {
		let p = Bare::new();
		p.monitor.begin();
		let calls = Arc::new(AtomicUsize::new(0));
		p.add_exit_listener(Box::new(|_| panic!("listener blew up")));
		let c = Arc::clone(&calls);
		p.add_exit_listener(Box::new(move |_| {
			c.fetch_add(1, Ordering::SeqCst);
		}));
		p.monitor.finalize(p.as_ref(), Ok(0));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert!(p.completion().is_done());
	}

	#[test]
	fn listener_may_reenter_the_proc() {
		let p = Bare::new();
		p.monitor.begin();
		let calls = Arc::new(AtomicUsize::new(0));
		let c = Arc::clone(&calls);
		p.add_exit_listener(Box::new(move |proc| {
			let c = Arc::clone(&c);
			proc.add_exit_listener(Box::new(move |_| {
				c.fetch_add(1, Ordering::SeqCst);
			}));
		}));
		p.monitor.finalize(p.as_ref(), Ok(0));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn waiters_before_start_all_release() {
		let p = Bare::new();
		let mut waiters = Vec::new();
		for _ in 0..8 {
			let p = Arc::clone(&p);
			waiters.push(tokio::spawn(async move {
				p.wait().await;
				(p.state(), p.exit_code_now())
			}));
		}
		assert!(!p.wait_for(Duration::from_millis(20)).await);

		p.monitor.begin();
		p.monitor.finalize(p.as_ref(), Ok(42));

		for w in waiters {
			assert_eq!(w.await.unwrap(), (State::Finished, 42));
		}
		assert!(p.wait_for(Duration::from_millis(1)).await);
		assert_eq!(p.exit_code().await, 42);
	}

	#[tokio::test]
	async fn listener_runs_before_waiters_release() {
		let p = Bare::new();
		p.monitor.begin();
		let flag = Arc::new(AtomicUsize::new(0));
		let f = Arc::clone(&flag);
		p.add_exit_listener(Box::new(move |_| {
			f.store(1, Ordering::SeqCst);
		}));
		let waiter = {
			let p = Arc::clone(&p);
			let flag = Arc::clone(&flag);
			tokio::spawn(async move {
				p.wait().await;
				flag.load(Ordering::SeqCst)
			})
		};
		tokio::task::yield_now().await;
		p.monitor.finalize(p.as_ref(), Ok(0));
		assert_eq!(waiter.await.unwrap(), 1);
	}

	#[tokio::test]
	async fn dropped_monitor_releases_waiters_without_opening() {
		let m = Monitor::new();
		let gate = m.completion();
		drop(m);
		gate.wait().await;
		assert!(!gate.is_done());
	}

	#[tokio::test]
	async fn bounded_wait_times_out_on_running() {
		let p = Bare::new();
		p.monitor.begin();
		assert!(!p.wait_for(Duration::from_millis(10)).await);
		assert_eq!(p.exit_code_within(Duration::from_millis(10)).await, UNDEFINED_EXIT);
		assert_eq!(p.state(), State::Running);
	}
}

//! OS-backed [`Proc`]: fork/exec through `std::process`, exit discovery
//! through `waitpid`.
//!
//! `waitpid` returns for more than process exit. Stop and continue
//! notifications, ptrace events, and `EINTR` all come back through the same
//! call, so a single wait can't be trusted to mean "it's over". The monitor
//! thread classifies every result and keeps waiting until it sees a real exit
//! or a real error.

use std::io;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, MonitorError, Result};
use crate::monitor::Monitor;
use crate::proc::{Completion, ExitListener, Proc, ProcHandle, NO_PID};
use crate::state::State;
use crate::stdio::{Pumps, Wiring};
use crate::template::Template;

/// Conventional shell offset for signal deaths: SIGINT is 130, SIGKILL 137.
const SIGNAL_EXIT_BASE: i32 = 128;

pub struct ExecProc {
	monitor: Monitor,
	pid: i32,
	name: String,
	/// Set under the lock when the pid is reaped. `signal` holds the same lock
	/// across its `kill`, so it can never hit a recycled pid.
	reaped: Mutex<bool>,
}

#[derive(Debug, PartialEq, Eq)]
enum WaitOutcome {
	Exited(i32),
	Signaled(i32),
	/// Not a termination; wait again.
	Ambiguous,
	Error(Errno),
}

pub(crate) fn launch(
	template: &Template,
	hook: Option<&(dyn Fn(&mut Command) + Send + Sync)>,
) -> Result<ProcHandle> {
	let (name, rest) = template.args.split_first().ok_or(Error::NoArguments)?;

	if let Some(dir) = &template.cwd {
		check_cwd(dir)?;
	}

	let mut wiring = Wiring::resolve(
		template.stdin.as_ref(),
		template.stdout.as_ref(),
		template.stderr.as_ref(),
	)?;
	let (stdin, stdout, stderr) = wiring.take_stdio();

	let mut cmd = Command::new(name);
	cmd.args(rest)
		.env_clear()
		.envs(template.env.iter())
		.stdin(stdin)
		.stdout(stdout)
		.stderr(stderr);
	if let Some(dir) = &template.cwd {
		cmd.current_dir(dir);
	}
	if let Some(hook) = hook {
		hook(&mut cmd);
	}

	debug!(argv = ?template.args, cwd = ?template.cwd, "launching");

	let mut child = cmd
		.spawn()
		.map_err(|e| spawn_error(name, template.cwd.as_deref(), e))?;
	let pumps = wiring.attach(child.stdin.take(), child.stdout.take(), child.stderr.take());

	Ok(ExecProc::start(name.clone(), child, pumps))
}

fn check_cwd(dir: &Path) -> Result<()> {
	match std::fs::metadata(dir) {
		Ok(meta) if meta.is_dir() => Ok(()),
		Ok(_) => Err(Error::NoSuchCwd {
			path: dir.to_path_buf(),
			source: io::Error::new(io::ErrorKind::Other, "not a directory"),
		}),
		Err(source) => Err(Error::NoSuchCwd {
			path: dir.to_path_buf(),
			source,
		}),
	}
}

/// `ENOENT` from the child's `chdir` and from its `execvp` look the same, so a
/// not-found failure re-checks the cwd before blaming the command.
fn spawn_error(name: &str, cwd: Option<&Path>, source: io::Error) -> Error {
	match source.kind() {
		io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
			if let Some(Err(cwd_err)) = cwd.map(check_cwd) {
				return cwd_err;
			}
			Error::NoSuchCommand {
				name: name.to_string(),
				source,
			}
		}
		_ => Error::Launch {
			name: name.to_string(),
			source,
		},
	}
}

impl ExecProc {
	fn start(name: String, child: Child, pumps: Pumps) -> ProcHandle {
		let proc = Arc::new(ExecProc {
			monitor: Monitor::new(),
			pid: child.id() as i32,
			name,
			reaped: Mutex::new(false),
		});
		proc.monitor.begin();
		info!(pid = proc.pid, cmd = %proc.name, "proc started");

		let watcher = Arc::clone(&proc);
		let spawned = thread::Builder::new()
			.name(format!("nezuko-wait-{}", proc.pid))
			.spawn(move || watcher.wait_and_handle_exit(child, pumps));

		if let Err(e) = spawned {
			warn!(pid = proc.pid, error = %e, "failed to start monitor thread");
			proc.monitor.finalize(proc.as_ref(), Err(MonitorError::new(e)));
		}
		proc
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	fn wait_and_handle_exit(&self, child: Child, pumps: Pumps) {
		let outcome = self.wait_exit();

		// The pid is already reaped, so std's handle must not wait on it again
		// (the pid may be recycled by now). Dropping it releases our end of
		// the pipes; joining the pumps makes captured output complete.
		drop(child);
		pumps.join();

		if let Err(err) = &outcome {
			warn!(pid = self.pid, error = %err, "lost track of proc");
		}
		self.monitor.finalize(self, outcome);
	}

	fn wait_exit(&self) -> std::result::Result<i32, MonitorError> {
		let pid = Pid::from_raw(self.pid);
		let outcome = loop {
			match classify(wait_once(pid)) {
				WaitOutcome::Exited(code) => break Ok(code),
				WaitOutcome::Signaled(signal) => break Ok(SIGNAL_EXIT_BASE + signal),
				WaitOutcome::Ambiguous => continue,
				WaitOutcome::Error(errno) => break Err(MonitorError::from(errno)),
			}
		};
		self.release(pid);
		outcome
	}

	/// Marks the pid as gone, reaping it first if `wait_once` only peeked.
	fn release(&self, pid: Pid) {
		let mut reaped = self.lock_reaped();
		if PEEKS_WITHOUT_REAPING {
			let _ = waitpid(pid, None);
		}
		*reaped = true;
		trace!(pid = self.pid, "reaped");
	}

	fn lock_reaped(&self) -> MutexGuard<'_, bool> {
		self.reaped.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// Whether [`wait_once`] leaves the zombie in place for [`ExecProc::release`].
const PEEKS_WITHOUT_REAPING: bool = cfg!(any(target_os = "linux", target_os = "android"));

/// Blocks until the child exits. On Linux the exit is observed with
/// `WNOWAIT`, so the pid stays reserved until `release` reaps it under the
/// lock `signal` uses.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn wait_once(pid: Pid) -> nix::Result<WaitStatus> {
	use nix::sys::wait::{waitid, Id, WaitPidFlag};
	waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn wait_once(pid: Pid) -> nix::Result<WaitStatus> {
	waitpid(pid, None)
}

fn classify(result: nix::Result<WaitStatus>) -> WaitOutcome {
	match result {
		Ok(WaitStatus::Exited(_, code)) => WaitOutcome::Exited(code),
		Ok(WaitStatus::Signaled(_, signal, _)) => WaitOutcome::Signaled(signal as i32),
		Ok(status) => {
			trace!(?status, "ignoring non-terminal wait status");
			WaitOutcome::Ambiguous
		}
		Err(Errno::EINTR) => WaitOutcome::Ambiguous,
		Err(errno) => WaitOutcome::Error(errno),
	}
}

impl Proc for ExecProc {
	fn state(&self) -> State {
		self.monitor.state()
	}

	fn pid(&self) -> i32 {
		if self.state().is_started() {
			self.pid
		} else {
			NO_PID
		}
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

	fn signal(&self, signal: Signal) -> Result<()> {
		let reaped = self.lock_reaped();
		if *reaped || !self.state().is_running() {
			return Ok(());
		}
		let sent = kill(Pid::from_raw(self.pid), signal);
		drop(reaped);
		match sent {
			// Already gone; the wait loop will notice.
			Ok(()) | Err(Errno::ESRCH) => Ok(()),
			Err(source) => {
				warn!(pid = self.pid, %signal, error = %source, "failed to signal proc");
				Err(Error::Signal {
					pid: self.pid,
					source,
				})
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pid() -> Pid {
		Pid::from_raw(4242)
	}

	#[test]
	fn classify_exit_and_signal() {
		assert_eq!(classify(Ok(WaitStatus::Exited(pid(), 3))), WaitOutcome::Exited(3));
		assert_eq!(
			classify(Ok(WaitStatus::Signaled(pid(), Signal::SIGKILL, false))),
			WaitOutcome::Signaled(9)
		);
	}

	#[test]
	fn classify_non_terminal_as_ambiguous() {
		assert_eq!(
			classify(Ok(WaitStatus::Stopped(pid(), Signal::SIGSTOP))),
			WaitOutcome::Ambiguous
		);
		assert_eq!(classify(Ok(WaitStatus::Continued(pid()))), WaitOutcome::Ambiguous);
		assert_eq!(classify(Ok(WaitStatus::StillAlive)), WaitOutcome::Ambiguous);
		assert_eq!(classify(Err(Errno::EINTR)), WaitOutcome::Ambiguous);
	}

	#[test]
	fn classify_errors() {
		assert_eq!(classify(Err(Errno::ECHILD)), WaitOutcome::Error(Errno::ECHILD));
	}

	#[test]
	fn signal_after_reap_never_reaches_the_pid() {
		// Stands in for whatever process inherits a recycled pid.
		let mut bystander = Command::new("sleep").arg("5").spawn().unwrap();
		let proc = ExecProc {
			monitor: Monitor::new(),
			pid: bystander.id() as i32,
			name: "sleep".into(),
			reaped: Mutex::new(true),
		};
		proc.monitor.begin();
		assert_eq!(proc.state(), State::Running);

		assert!(proc.kill().is_ok());
		assert!(proc.signal(Signal::SIGTERM).is_ok());
		std::thread::sleep(std::time::Duration::from_millis(100));
		assert!(bystander.try_wait().unwrap().is_none());

		bystander.kill().unwrap();
		bystander.wait().unwrap();
	}

	#[test]
	fn signal_before_reap_is_delivered() {
		let mut child = Command::new("sleep").arg("5").spawn().unwrap();
		let proc = ExecProc {
			monitor: Monitor::new(),
			pid: child.id() as i32,
			name: "sleep".into(),
			reaped: Mutex::new(false),
		};
		proc.monitor.begin();
		assert!(proc.kill().is_ok());
		let status = child.wait().unwrap();
		assert_eq!(std::os::unix::process::ExitStatusExt::signal(&status), Some(9));
	}

	#[test]
	fn missing_cwd_is_reported_before_spawn() {
		let t = Template::new(["true"]).cwd("/definitely/not/a/dir");
		match launch(&t, None) {
			Err(Error::NoSuchCwd { path, .. }) => {
				assert_eq!(path, Path::new("/definitely/not/a/dir"))
			}
			other => panic!("unexpected {:?}", other.map(|p| p.pid())),
		}
	}

	#[test]
	fn missing_command_is_reported_before_monitor() {
		let t = Template::new(["nezuko-no-such-binary-xyz"]);
		assert!(matches!(launch(&t, None), Err(Error::NoSuchCommand { .. })));
	}
}

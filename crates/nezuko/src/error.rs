//! Error types for templating, launching, and monitoring commands.
//!
//! Errors fall into a few groups:
//!
//! - configuration: [`Error::IncomprehensibleModifier`], [`Error::NoArguments`],
//!   [`Error::UnadaptableStream`], [`Error::StreamOpen`]
//! - launch: [`Error::NoSuchCommand`], [`Error::NoSuchCwd`], [`Error::Launch`]
//! - monitoring: [`Error::Monitor`]
//! - policy: [`Error::FailureExitCode`]
//!
//! Monitoring errors are recorded on the [`Proc`](crate::Proc) rather than
//! returned from `start`, since by the time they happen nobody is waiting on a
//! call to return them to. [`Template::run`](crate::Template::run) is the one
//! place that surfaces them as an `Err`.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	/// A loosely-typed fragment had a shape bake doesn't understand.
	#[error("incomprehensible command modifier: do not want {shape}")]
	IncomprehensibleModifier { shape: String },

	/// A template was launched with an empty argument vector.
	#[error("no arguments specified")]
	NoArguments,

	/// A stream descriptor could not be turned into a readable or writable stream.
	#[error("cannot adapt {shape} to a stream")]
	UnadaptableStream { shape: String },

	#[error("cannot open {path:?} for stdio: {source}")]
	StreamOpen {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	/// The command name (argv[0]) could not be found or is not executable.
	#[error("command not found: {name:?}")]
	NoSuchCommand {
		name: String,
		#[source]
		source: io::Error,
	},

	#[error("cannot use {path:?} for cwd: {source}")]
	NoSuchCwd {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	/// Any other process-creation failure.
	#[error("failed to launch {name:?}: {source}")]
	Launch {
		name: String,
		#[source]
		source: io::Error,
	},

	#[error(transparent)]
	Monitor(#[from] MonitorError),

	/// A command exited with a code outside its acceptable set.
	#[error("command {cmdname:?} exited with unexpected status {code}{}", format_output(.message))]
	FailureExitCode {
		cmdname: String,
		code: i32,
		message: String,
	},

	#[error("failed to signal pid {pid}: {source}")]
	Signal {
		pid: i32,
		#[source]
		source: Errno,
	},

	#[error("failed to read {path:?}: {source}")]
	ConfigRead {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("failed to parse {path:?}: {source}")]
	ConfigParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("no command named {name:?} in config")]
	UnknownCommand { name: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of the wait primitive after a process started.
///
/// Once one of these is recorded the proc is `Panicked` and its exit code is
/// undefined. Cheap to clone so every observer can hold the same cause.
#[derive(Debug, Clone, Error)]
#[error("error monitoring proc: {cause}")]
pub struct MonitorError {
	cause: Arc<io::Error>,
}

impl MonitorError {
	pub fn new(cause: io::Error) -> Self {
		Self {
			cause: Arc::new(cause),
		}
	}

	pub fn cause(&self) -> &io::Error {
		&self.cause
	}
}

impl From<Errno> for MonitorError {
	fn from(errno: Errno) -> Self {
		Self::new(io::Error::from(errno))
	}
}

fn format_output(message: &str) -> String {
	if message.is_empty() {
		return String::new();
	}
	format!(
		"\n\tCommand output was:\n\t\t\"\"\"\n\t\t{}\n\t\t\"\"\"",
		message.replace('\n', "\n\t\t")
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn failure_without_output_is_one_line() {
		let err = Error::FailureExitCode {
			cmdname: "false".into(),
			code: 1,
			message: String::new(),
		};
		assert_eq!(err.to_string(), "command \"false\" exited with unexpected status 1");
	}

	#[test]
	fn failure_with_output_indents_it() {
		let err = Error::FailureExitCode {
			cmdname: "bash".into(),
			code: 22,
			message: "one\ntwo".into(),
		};
		let text = err.to_string();
		assert!(text.starts_with("command \"bash\" exited with unexpected status 22\n"));
		assert!(text.contains("\t\tone\n\t\ttwo\n"));
	}

	#[test]
	fn monitor_error_keeps_errno() {
		let err = MonitorError::from(Errno::ECHILD);
		assert_eq!(err.cause().raw_os_error(), Some(Errno::ECHILD as i32));
		assert!(Error::from(err).to_string().starts_with("error monitoring proc:"));
	}
}

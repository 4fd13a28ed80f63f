//! Immutable descriptions of not-yet-launched commands.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::env::Env;
use crate::error::{Error, Result};
use crate::launcher::{exec_launcher, Launcher};
use crate::proc::{Proc, ProcHandle};
use crate::state::State;
use crate::stdio::{shares_capture, Capture, Input, Output};

/// Exit codes a command may finish with and still count as a success.
///
/// Empty means `{0}`. An explicit set replaces the default entirely, so `{1}`
/// does not accept 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExitCodes(BTreeSet<i32>);

impl ExitCodes {
	/// Every code a process can exit with.
	pub fn any() -> Self {
		(0..=255).collect()
	}

	pub fn accepts(&self, code: i32) -> bool {
		if self.0.is_empty() {
			code == 0
		} else {
			self.0.contains(&code)
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
		self.0.iter().copied()
	}
}

impl Default for ExitCodes {
	fn default() -> Self {
		Self(BTreeSet::from([0]))
	}
}

impl FromIterator<i32> for ExitCodes {
	fn from_iter<I: IntoIterator<Item = i32>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl<const N: usize> From<[i32; N]> for ExitCodes {
	fn from(codes: [i32; N]) -> Self {
		codes.into_iter().collect()
	}
}

impl From<Vec<i32>> for ExitCodes {
	fn from(codes: Vec<i32>) -> Self {
		codes.into_iter().collect()
	}
}

/// Everything needed to launch one command.
///
/// Templates are values: every setter, [`merge`](Template::merge), and
/// [`bake`](Template::bake) returns a new template and leaves its inputs
/// alone, so one parent can be forked into any number of children. The only
/// shared state is inside stream descriptors that are shared by nature
/// (captures, writers, channels).
#[derive(Clone, Default)]
pub struct Template {
	pub(crate) args: Vec<String>,
	pub(crate) env: Env,
	pub(crate) cwd: Option<PathBuf>,
	pub(crate) stdin: Option<Input>,
	pub(crate) stdout: Option<Output>,
	pub(crate) stderr: Option<Output>,
	pub(crate) ok_exit: Option<ExitCodes>,
	pub(crate) launcher: Option<Launcher>,
}

impl Template {
	/// A template holding only `args`. Useful as a fragment.
	pub fn new<I, S>(args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			args: args.into_iter().map(Into::into).collect(),
			..Self::default()
		}
	}

	/// Default configuration for launching: the exec launcher, `{0}` as the
	/// acceptable exit codes, and `env` as the starting environment.
	pub fn base(env: Env) -> Self {
		Self {
			env,
			ok_exit: Some(ExitCodes::default()),
			launcher: Some(exec_launcher()),
			..Self::default()
		}
	}

	/// Connects stdin, stdout, and stderr to this process's own.
	pub fn default_io() -> Self {
		Self::default()
			.stdin(Input::Inherit)
			.stdout(Output::Inherit)
			.stderr(Output::Inherit)
	}

	/// Disconnects stdin and discards all output.
	pub fn null_io() -> Self {
		Self::default()
			.stdin(Input::Null)
			.stdout(Output::Null)
			.stderr(Output::Null)
	}

	/// Applies `other` on top of `self`. Arguments concatenate, environments
	/// merge, and each other field takes `other`'s value when it has one.
	pub fn merge(&self, other: &Template) -> Template {
		let mut args = Vec::with_capacity(self.args.len() + other.args.len());
		args.extend_from_slice(&self.args);
		args.extend_from_slice(&other.args);
		Template {
			args,
			env: self.env.merge(&other.env),
			cwd: other.cwd.clone().or_else(|| self.cwd.clone()),
			stdin: other.stdin.clone().or_else(|| self.stdin.clone()),
			stdout: other.stdout.clone().or_else(|| self.stdout.clone()),
			stderr: other.stderr.clone().or_else(|| self.stderr.clone()),
			ok_exit: other.ok_exit.clone().or_else(|| self.ok_exit.clone()),
			launcher: other.launcher.clone().or_else(|| self.launcher.clone()),
		}
	}

	pub fn arg(self, arg: impl Into<String>) -> Self {
		self.merge(&Template::new([arg.into()]))
	}

	pub fn args<I, S>(self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.merge(&Template::new(args))
	}

	/// Merges `env` into the environment (empty values delete).
	pub fn env(mut self, env: Env) -> Self {
		self.env = self.env.merge(&env);
		self
	}

	pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
		self.cwd = Some(dir.into());
		self
	}

	pub fn stdin(mut self, input: impl Into<Input>) -> Self {
		self.stdin = Some(input.into());
		self
	}

	pub fn stdout(mut self, output: impl Into<Output>) -> Self {
		self.stdout = Some(output.into());
		self
	}

	pub fn stderr(mut self, output: impl Into<Output>) -> Self {
		self.stderr = Some(output.into());
		self
	}

	pub fn ok_exit(mut self, codes: impl Into<ExitCodes>) -> Self {
		self.ok_exit = Some(codes.into());
		self
	}

	pub fn launcher(mut self, launcher: Launcher) -> Self {
		self.launcher = Some(launcher);
		self
	}

	pub fn argv(&self) -> &[String] {
		&self.args
	}

	pub fn environment(&self) -> &Env {
		&self.env
	}

	pub fn working_dir(&self) -> Option<&Path> {
		self.cwd.as_deref()
	}

	pub fn stdin_source(&self) -> Option<&Input> {
		self.stdin.as_ref()
	}

	pub fn stdout_target(&self) -> Option<&Output> {
		self.stdout.as_ref()
	}

	pub fn stderr_target(&self) -> Option<&Output> {
		self.stderr.as_ref()
	}

	/// The acceptable exit codes, `{0}` when unset.
	pub fn exit_codes(&self) -> ExitCodes {
		self.ok_exit.clone().unwrap_or_default()
	}

	pub fn name(&self) -> &str {
		self.args.first().map(String::as_str).unwrap_or("")
	}

	/// Launches the command and returns as soon as the process exists.
	pub fn start(&self) -> Result<ProcHandle> {
		if self.args.is_empty() {
			return Err(Error::NoArguments);
		}
		match &self.launcher {
			Some(launch) => launch(self),
			None => exec_launcher()(self),
		}
	}

	/// Launches the command, waits for it, and checks its exit code.
	///
	/// A code outside [`exit_codes`](Template::exit_codes) is an
	/// [`Error::FailureExitCode`] carrying whatever output was captured. A
	/// proc whose monitoring failed is an [`Error::Monitor`].
	pub async fn run(&self) -> Result<ProcHandle> {
		let proc = self.start()?;
		proc.wait().await;

		if proc.state() == State::Panicked {
			if let Some(err) = proc.error() {
				return Err(Error::Monitor(err));
			}
		}

		let code = proc.exit_code_now();
		if !self.exit_codes().accepts(code) {
			return Err(Error::FailureExitCode {
				cmdname: self.name().to_string(),
				code,
				message: self.captured_output(),
			});
		}
		Ok(proc)
	}
}

impl Template {
	/// Text collected by stdout and stderr captures, each buffer once.
	fn captured_output(&self) -> String {
		let stdout = self.stdout_target();
		let stderr = self.stderr_target();
		let mut text = stdout.and_then(Output::as_capture).map(Capture::text).unwrap_or_default();
		if !shares_capture(stdout, stderr) {
			if let Some(capture) = stderr.and_then(Output::as_capture) {
				text.push_str(&capture.text());
			}
		}
		text
	}
}

impl fmt::Debug for Template {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Template")
			.field("args", &self.args)
			.field("env", &format_args!("{} vars", self.env.len()))
			.field("cwd", &self.cwd)
			.field("stdin", &self.stdin)
			.field("stdout", &self.stdout)
			.field("stderr", &self.stderr)
			.field("ok_exit", &self.ok_exit)
			.field("launcher", &self.launcher.as_ref().map(|_| "custom"))
			.finish()
	}
}

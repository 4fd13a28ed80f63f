//! # nezuko
//!
//! Composable command templates and race-free process monitors.
//!
//! Build a [`Template`] by baking fragments onto a base, launch it, and watch
//! the resulting [`Proc`] from as many tasks as you like. [`Template::run`]
//! waits and fails on unexpected exit codes, which makes a chain of commands
//! read like a shell script run with `set -e`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use nezuko::{sh, Capture, Env, Fragment, Proc, Template};
//!
//! # #[tokio::main]
//! # async fn main() -> nezuko::Result<()> {
//! let shell = sh(["bash", "-c"]);
//!
//! let out = Capture::new();
//! shell
//! 	.bake([Fragment::from(Env::from([("NAME", "world")])), "echo hello $NAME".into()])
//! 	.stdout(out.clone())
//! 	.run()
//! 	.await?;
//! assert_eq!(out.text(), "hello world\n");
//!
//! // Accept a nonzero exit instead of failing on it.
//! shell.bake(["exit 22"]).ok_exit([22]).run().await?;
//!
//! // Or drive the process yourself.
//! let proc = sh(["sleep", "10"]).merge(&Template::null_io()).start()?;
//! proc.kill()?;
//! assert_eq!(proc.exit_code().await, 137);
//! # Ok(())
//! # }
//! ```

pub mod bake;
pub mod config;
pub mod env;
pub mod error;
pub mod exec;
pub mod launcher;
pub mod monitor;
pub mod proc;
pub mod state;
pub mod stdio;
pub mod template;

pub use bake::{ClearEnv, Fragment};
pub use env::Env;
pub use error::{Error, MonitorError, Result};
pub use exec::ExecProc;
pub use launcher::{exec_launcher, exec_launcher_with, Launcher};
pub use monitor::Monitor;
pub use proc::{Completion, ExitListener, Proc, ProcHandle, NO_PID, UNDEFINED_EXIT};
pub use state::State;
pub use stdio::{Capture, Input, Output};
pub use template::{ExitCodes, Template};

/// A template seeded with the current OS environment, the exec launcher, and
/// `{0}` as the acceptable exit codes, with `fragments` baked on.
pub fn sh<I, F>(fragments: I) -> Template
where
	I: IntoIterator<Item = F>,
	F: Into<Fragment>,
{
	Template::base(Env::from_os()).bake(fragments)
}

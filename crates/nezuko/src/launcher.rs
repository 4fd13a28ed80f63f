use std::process::Command;
use std::sync::Arc;

use crate::error::Result;
use crate::exec;
use crate::proc::ProcHandle;
use crate::template::Template;

/// Turns a resolved template into a live process.
///
/// Swap one in with [`Template::launcher`] to add logging, tweak the OS
/// command at the last moment, or launch something that isn't an OS process at
/// all. Launchers must return once the process exists, without waiting on it.
pub type Launcher = Arc<dyn Fn(&Template) -> Result<ProcHandle> + Send + Sync>;

/// The platform launcher: fork/exec via `std::process`, monitored with `waitpid`.
pub fn exec_launcher() -> Launcher {
	Arc::new(|template: &Template| exec::launch(template, None))
}

/// Like [`exec_launcher`], but runs `hook` on the fully configured
/// [`Command`] right before it is spawned.
///
/// ```rust,no_run
/// use std::os::unix::process::CommandExt;
///
/// let launcher = nezuko::exec_launcher_with(|cmd| {
/// 	cmd.process_group(0);
/// });
/// let t = nezuko::sh(["sleep", "1"]).launcher(launcher);
/// ```
pub fn exec_launcher_with<F>(hook: F) -> Launcher
where
	F: Fn(&mut Command) + Send + Sync + 'static,
{
	Arc::new(move |template: &Template| exec::launch(template, Some(&hook)))
}

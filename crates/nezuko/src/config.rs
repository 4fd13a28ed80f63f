//! Named command templates loaded from a `nezuko.toml`.
//!
//! ```toml
//! [defaults]
//! inherit_env = true
//! env = { FORCE_COLOR = "1" }
//!
//! [commands.greet]
//! args = ["echo", "-n", "hello"]
//! stdout = "inherit"
//!
//! [commands.check]
//! args = ["bash", "-c"]
//! bake = ["exit 22", { ok_exit = [22] }]
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::bake::TemplateSpec;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::template::{ExitCodes, Template};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CommandFile {
	#[serde(default)]
	pub defaults: DefaultsConfig,
	#[serde(default)]
	pub commands: BTreeMap<String, CommandConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
	#[serde(default = "default_true")]
	pub inherit_env: bool,
	#[serde(default)]
	pub env: BTreeMap<String, String>,
	#[serde(default = "default_ok_exit")]
	pub ok_exit: Vec<i32>,
	pub cwd: Option<PathBuf>,
}

impl Default for DefaultsConfig {
	fn default() -> Self {
		Self {
			inherit_env: default_true(),
			env: BTreeMap::new(),
			ok_exit: default_ok_exit(),
			cwd: None,
		}
	}
}

fn default_true() -> bool {
	true
}
fn default_ok_exit() -> Vec<i32> {
	vec![0]
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default)]
	pub env: BTreeMap<String, String>,
	pub cwd: Option<PathBuf>,
	pub stdin: Option<toml::Value>,
	pub stdout: Option<toml::Value>,
	pub stderr: Option<toml::Value>,
	pub ok_exit: Option<Vec<i32>>,
	/// Loose fragments folded in after the fields above.
	#[serde(default)]
	pub bake: Vec<toml::Value>,
}

impl CommandConfig {
	fn spec(&self) -> TemplateSpec {
		TemplateSpec {
			args: self.args.clone(),
			env: self.env.clone(),
			cwd: self.cwd.clone(),
			stdin: self.stdin.clone(),
			stdout: self.stdout.clone(),
			stderr: self.stderr.clone(),
			ok_exit: self.ok_exit.clone(),
		}
	}
}

/// Loaded command file, ready to hand out templates.
#[derive(Debug, Clone)]
pub struct CommandBook {
	file: CommandFile,
	os_env: Env,
}

impl CommandBook {
	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
			path: path.to_path_buf(),
			source,
		})?;
		let file = toml::from_str(&content).map_err(|source| Error::ConfigParse {
			path: path.to_path_buf(),
			source,
		})?;
		tracing::debug!(path = %path.display(), "loaded command file");
		Ok(Self::new(file, Env::from_os()))
	}

	/// A book over `file`, using `os_env` wherever the OS environment would be
	/// inherited.
	pub fn new(file: CommandFile, os_env: Env) -> Self {
		Self { file, os_env }
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.file.commands.keys().map(String::as_str)
	}

	/// The base template every command starts from.
	pub fn defaults(&self) -> Template {
		let d = &self.file.defaults;
		let env = if d.inherit_env {
			self.os_env.clone()
		} else {
			Env::new()
		};
		let mut template = Template::base(env)
			.env(d.env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect())
			.ok_exit(d.ok_exit.iter().copied().collect::<ExitCodes>());
		if let Some(cwd) = &d.cwd {
			template = template.cwd(cwd);
		}
		template
	}

	pub fn template(&self, name: &str) -> Result<Template> {
		let command = self
			.file
			.commands
			.get(name)
			.ok_or_else(|| Error::UnknownCommand {
				name: name.to_string(),
			})?;
		let own = command.spec().into_template()?;
		self.defaults().merge(&own).bake_values(&command.bake)
	}
}

impl std::str::FromStr for CommandBook {
	type Err = toml::de::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(Self::new(toml::from_str(s)?, Env::from_os()))
	}
}

/// `$XDG_CONFIG_HOME/nezuko/nezuko.toml`, else `~/.config/nezuko/nezuko.toml`.
pub fn default_config_path() -> PathBuf {
	let dir = if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
		PathBuf::from(dir)
	} else if let Ok(home) = std::env::var("HOME") {
		PathBuf::from(home).join(".config")
	} else {
		PathBuf::from("/tmp")
	};
	dir.join("nezuko").join("nezuko.toml")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::stdio::{Input, Output};

	const SAMPLE: &str = r#"
[defaults]
inherit_env = false
env = { FORCE_COLOR = "1" }

[commands.greet]
args = ["echo", "-n", "hello"]
stdout = "capture"
env = { GREETING = "hi" }

[commands.check]
args = ["bash", "-c"]
bake = ["exit 22", { ok_exit = [22] }, { env = { FORCE_COLOR = "" } }]

[commands.feed]
args = ["cat"]
stdin = { text = "fed" }
cwd = "/tmp"
"#;

	fn book() -> CommandBook {
		CommandBook::new(toml::from_str(SAMPLE).unwrap(), Env::from([("HOME", "/root")]))
	}

	#[test]
	fn names_are_sorted() {
		assert_eq!(book().names().collect::<Vec<_>>(), vec!["check", "feed", "greet"]);
	}

	#[test]
	fn command_fields_layer_on_defaults() {
		let t = book().template("greet").unwrap();
		assert_eq!(t.argv(), ["echo", "-n", "hello"]);
		assert_eq!(
			t.environment(),
			&Env::from([("FORCE_COLOR", "1"), ("GREETING", "hi")])
		);
		assert!(matches!(t.stdout_target(), Some(Output::Capture(_))));
		assert!(t.exit_codes().accepts(0));
	}

	#[test]
	fn bake_list_applies_last() {
		let t = book().template("check").unwrap();
		assert_eq!(t.argv(), ["bash", "-c", "exit 22"]);
		assert!(t.exit_codes().accepts(22));
		assert!(!t.exit_codes().accepts(0));
		assert!(!t.environment().contains_key("FORCE_COLOR"));
	}

	#[test]
	fn stdin_and_cwd() {
		let t = book().template("feed").unwrap();
		assert!(matches!(t.stdin_source(), Some(Input::Text(s)) if s == "fed"));
		assert_eq!(t.working_dir(), Some(Path::new("/tmp")));
	}

	#[test]
	fn inherit_env_uses_snapshot() {
		let file: CommandFile = toml::from_str("[commands.x]\nargs = ['true']").unwrap();
		let book = CommandBook::new(file, Env::from([("HOME", "/root")]));
		assert_eq!(book.template("x").unwrap().environment().get("HOME"), Some("/root"));
	}

	#[test]
	fn unknown_command() {
		assert!(matches!(
			book().template("nope"),
			Err(Error::UnknownCommand { name }) if name == "nope"
		));
	}

	#[test]
	fn bad_bake_value_is_incomprehensible() {
		let file: CommandFile = toml::from_str("[commands.x]\nargs = ['true']\nbake = [7]").unwrap();
		let book = CommandBook::new(file, Env::new());
		assert!(matches!(
			book.template("x"),
			Err(Error::IncomprehensibleModifier { .. })
		));
	}

	#[test]
	fn load_reports_parse_errors_with_path() {
		let dir = std::env::temp_dir().join(format!("nezuko-config-{}", std::process::id()));
		let _ = std::fs::create_dir_all(&dir);
		let path = dir.join("nezuko.toml");
		std::fs::write(&path, "[commands.x\n").unwrap();
		assert!(matches!(
			CommandBook::load(&path),
			Err(Error::ConfigParse { path: p, .. }) if p == path
		));
		assert!(matches!(
			CommandBook::load(&dir.join("missing.toml")),
			Err(Error::ConfigRead { .. })
		));
		let _ = std::fs::remove_dir_all(&dir);
	}
}

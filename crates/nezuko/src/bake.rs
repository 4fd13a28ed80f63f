//! Folding configuration fragments into templates.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::env::Env;
use crate::error::{Error, Result};
use crate::stdio::{Input, Output};
use crate::template::{ExitCodes, Template};

/// One modifier accepted by [`Template::bake`].
#[derive(Debug, Clone)]
pub enum Fragment {
	Arg(String),
	Args(Vec<String>),
	Env(Env),
	ClearEnv,
	Template(Template),
}

/// Marker that drops every environment variable baked so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearEnv;

impl Template {
	/// Folds `fragments` into a copy of this template, left to right.
	///
	/// Arguments only ever accumulate; later fragments override earlier scalar
	/// fields. Pure: nothing is launched.
	pub fn bake<I, F>(&self, fragments: I) -> Template
	where
		I: IntoIterator<Item = F>,
		F: Into<Fragment>,
	{
		fragments
			.into_iter()
			.fold(self.clone(), |acc, fragment| acc.apply(fragment.into()))
	}

	/// [`bake`](Template::bake) for loosely-typed values, e.g. from a config file.
	pub fn bake_values(&self, values: &[toml::Value]) -> Result<Template> {
		let fragments = values
			.iter()
			.map(Fragment::from_value)
			.collect::<Result<Vec<_>>>()?;
		Ok(self.bake(fragments))
	}

	fn apply(self, fragment: Fragment) -> Template {
		match fragment {
			Fragment::Arg(arg) => self.merge(&Template::new([arg])),
			Fragment::Args(args) => self.merge(&Template::new(args)),
			Fragment::Env(env) => self.env(env),
			Fragment::ClearEnv => Template {
				env: Env::new(),
				..self
			},
			Fragment::Template(other) => self.merge(&other),
		}
	}
}

impl Fragment {
	/// Classifies a loosely-typed value.
	///
	/// Strings are arguments, arrays of strings are argument runs,
	/// `{ env = {..} }` is an environment, `{ clear_env = true }` clears it, and
	/// any other table is read as a partial template. Every other shape is an
	/// [`Error::IncomprehensibleModifier`].
	pub fn from_value(value: &toml::Value) -> Result<Fragment> {
		match value {
			toml::Value::String(s) => Ok(Fragment::Arg(s.clone())),
			toml::Value::Array(items) => items
				.iter()
				.map(|item| item.as_str().map(str::to_string))
				.collect::<Option<Vec<_>>>()
				.map(Fragment::Args)
				.ok_or_else(|| incomprehensible(value)),
			toml::Value::Table(table) => {
				if table.len() == 1 {
					if let Some(env) = table.get("env") {
						return Env::deserialize(env.clone())
							.map(Fragment::Env)
							.map_err(|_| incomprehensible(value));
					}
					if let Some(toml::Value::Boolean(true)) = table.get("clear_env") {
						return Ok(Fragment::ClearEnv);
					}
				}
				TemplateSpec::deserialize(value.clone())
					.map_err(|_| incomprehensible(value))?
					.into_template()
					.map(Fragment::Template)
			}
			_ => Err(incomprehensible(value)),
		}
	}
}

fn incomprehensible(value: &toml::Value) -> Error {
	Error::IncomprehensibleModifier {
		shape: describe(value),
	}
}

/// Human-readable shape of a config value, for error messages.
pub(crate) fn describe(value: &toml::Value) -> String {
	match value {
		toml::Value::String(s) => format!("string {:?}", s),
		toml::Value::Integer(_) => "integer".into(),
		toml::Value::Float(_) => "float".into(),
		toml::Value::Boolean(_) => "boolean".into(),
		toml::Value::Datetime(_) => "datetime".into(),
		toml::Value::Array(items) => match items.iter().find(|v| !v.is_str()) {
			Some(odd) => format!("array containing {}", describe(odd)),
			None => "array".into(),
		},
		toml::Value::Table(table) => {
			let keys: Vec<&str> = table.keys().map(String::as_str).collect();
			format!("table with keys [{}]", keys.join(", "))
		}
	}
}

/// Serialized form of a partial template.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateSpec {
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default)]
	pub env: BTreeMap<String, String>,
	pub cwd: Option<PathBuf>,
	pub stdin: Option<toml::Value>,
	pub stdout: Option<toml::Value>,
	pub stderr: Option<toml::Value>,
	pub ok_exit: Option<Vec<i32>>,
}

impl TemplateSpec {
	pub fn into_template(self) -> Result<Template> {
		let mut template = Template::new(self.args).env(self.env.into_iter().collect());
		if let Some(cwd) = self.cwd {
			template = template.cwd(cwd);
		}
		if let Some(stdin) = self.stdin {
			template = template.stdin(Input::from_value(&stdin)?);
		}
		let stdout = self.stdout.as_ref().map(Output::from_value).transpose()?;
		let stderr = match (&self.stderr, &self.stdout) {
			// Same spelling for both means one shared sink, so "capture" twice
			// collects combined output.
			(Some(err), Some(out)) if err == out => stdout.clone(),
			(Some(err), _) => Some(Output::from_value(err)?),
			(None, _) => None,
		};
		if let Some(stdout) = stdout {
			template = template.stdout(stdout);
		}
		if let Some(stderr) = stderr {
			template = template.stderr(stderr);
		}
		if let Some(codes) = self.ok_exit {
			template = template.ok_exit(codes.into_iter().collect::<ExitCodes>());
		}
		Ok(template)
	}
}

impl From<&str> for Fragment {
	fn from(arg: &str) -> Self {
		Fragment::Arg(arg.to_string())
	}
}

impl From<String> for Fragment {
	fn from(arg: String) -> Self {
		Fragment::Arg(arg)
	}
}

impl From<Vec<String>> for Fragment {
	fn from(args: Vec<String>) -> Self {
		Fragment::Args(args)
	}
}

impl From<Vec<&str>> for Fragment {
	fn from(args: Vec<&str>) -> Self {
		Fragment::Args(args.into_iter().map(str::to_string).collect())
	}
}

impl<const N: usize> From<[&str; N]> for Fragment {
	fn from(args: [&str; N]) -> Self {
		Fragment::Args(args.iter().map(|s| s.to_string()).collect())
	}
}

impl From<&[String]> for Fragment {
	fn from(args: &[String]) -> Self {
		Fragment::Args(args.to_vec())
	}
}

impl From<Env> for Fragment {
	fn from(env: Env) -> Self {
		Fragment::Env(env)
	}
}

impl From<ClearEnv> for Fragment {
	fn from(_: ClearEnv) -> Self {
		Fragment::ClearEnv
	}
}

impl From<Template> for Fragment {
	fn from(template: Template) -> Self {
		Fragment::Template(template)
	}
}

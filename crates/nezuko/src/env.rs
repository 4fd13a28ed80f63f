use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Environment variables for a command.
///
/// An empty value marks a variable as unset. Markers are kept through every
/// merge, so an overlay built on its own still deletes the key once it lands
/// on a base. The read side ([`get`](Env::get), [`iter`](Env::iter),
/// [`to_argv`](Env::to_argv)) only ever sees set variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Env(BTreeMap<String, String>);

impl Env {
	pub fn new() -> Self {
		Self::default()
	}

	/// Snapshot of the current process environment.
	///
	/// Entries that aren't valid UTF-8 are skipped.
	pub fn from_os() -> Self {
		std::env::vars_os()
			.filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
			.collect()
	}

	/// Returns `overlay` applied on top of `self`. Every key in `overlay` wins,
	/// and an empty value carries over as an unset marker.
	pub fn merge(&self, overlay: &Env) -> Env {
		let mut merged = self.0.clone();
		merged.extend(overlay.0.iter().map(|(k, v)| (k.clone(), v.clone())));
		Env(merged)
	}

	/// `KEY=VALUE` strings for set variables, in key order.
	pub fn to_argv(&self) -> Vec<String> {
		self.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
	}

	pub fn contains_key(&self, key: &str) -> bool {
		self.get(key).is_some()
	}

	/// Number of set variables.
	pub fn len(&self) -> usize {
		self.iter().count()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Set variables in key order.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0
			.iter()
			.filter(|(_, v)| !v.is_empty())
			.map(|(k, v)| (k.as_str(), v.as_str()))
	}

	/// Keys this env unsets when merged onto another.
	pub fn unset_keys(&self) -> impl Iterator<Item = &str> {
		self.0
			.iter()
			.filter(|(_, v)| v.is_empty())
			.map(|(k, _)| k.as_str())
	}
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Env {
	fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
		Env(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
	}
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Env {
	fn from(pairs: [(K, V); N]) -> Self {
		pairs.into_iter().collect()
	}
}

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the demo binary: either a ready-made relay
/// connection string, or its constituent parts. A plain serde struct with
/// optional fields, constructed from a JSON file or inline bytes.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	pub connection_string: Option<String>,
	pub address: Option<String>,
	pub shared_access_key_name: Option<String>,
	pub shared_access_key: Option<String>,
	#[serde(default = "default_open_timeout_secs")]
	pub open_timeout_secs: u64,
	#[serde(default)]
	pub metrics_enabled: bool,
}

fn default_open_timeout_secs() -> u64 {
	30
}

impl Config {
	pub fn open_timeout(&self) -> Duration {
		Duration::from_secs(self.open_timeout_secs)
	}
}

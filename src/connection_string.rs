use crate::error::TokenError;
use std::collections::HashMap;
use std::time::Duration;

/// Parsed form of `Endpoint=sb://...;EntityPath=...;SharedAccessKeyName=...;
/// SharedAccessKey=...;OperationTimeout=PT...S`. External-collaborator
/// surface named in the external interfaces section; the core never parses
/// this itself, it just consumes the `Address` + key material this produces.
#[derive(Clone, Debug)]
pub struct ConnectionStringProperties {
	pub endpoint: String,
	pub entity_path: String,
	pub shared_access_key_name: Option<String>,
	pub shared_access_key: Option<String>,
	pub operation_timeout: Option<Duration>,
}

impl ConnectionStringProperties {
	pub fn parse(connection_string: &str) -> Result<Self, TokenError> {
		let mut fields: HashMap<String, String> = HashMap::new();
		for pair in connection_string.split(';') {
			let pair = pair.trim();
			if pair.is_empty() {
				continue;
			}
			let (key, value) = pair.split_once('=').ok_or_else(|| {
				TokenError::ConnectionString(format!("malformed segment: '{pair}'"))
			})?;
			fields.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
		}

		let endpoint = fields
			.remove("endpoint")
			.ok_or_else(|| TokenError::ConnectionString("missing Endpoint".to_string()))?;
		let entity_path = fields
			.remove("entitypath")
			.ok_or_else(|| TokenError::ConnectionString("missing EntityPath".to_string()))?;
		let shared_access_key_name = fields.remove("sharedaccesskeyname");
		let shared_access_key = fields.remove("sharedaccesskey");
		let operation_timeout = fields
			.remove("operationtimeout")
			.map(|s| parse_iso8601_duration(&s))
			.transpose()?;

		Ok(Self {
			endpoint,
			entity_path,
			shared_access_key_name,
			shared_access_key,
			operation_timeout,
		})
	}

	/// The `sb://` address this connection string resolves to.
	pub fn address(&self) -> String {
		let endpoint = self.endpoint.trim_end_matches('/');
		format!("{endpoint}/{}", self.entity_path.trim_start_matches('/'))
	}
}

/// Parses the subset of ISO-8601 durations the relay actually emits:
/// `PT<seconds>S` (optionally with a leading integer minutes component is
/// not observed in practice, so only whole-seconds form is supported).
fn parse_iso8601_duration(s: &str) -> Result<Duration, TokenError> {
	let s = s
		.strip_prefix("PT")
		.ok_or_else(|| TokenError::ConnectionString(format!("unsupported duration '{s}'")))?;
	let s = s
		.strip_suffix('S')
		.ok_or_else(|| TokenError::ConnectionString(format!("unsupported duration 'PT{s}'")))?;
	let secs: f64 = s
		.parse()
		.map_err(|_| TokenError::ConnectionString(format!("unsupported duration 'PT{s}S'")))?;
	Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_full_connection_string() {
		let cs = ConnectionStringProperties::parse(
			"Endpoint=sb://my-ns.servicebus.windows.net/;EntityPath=my-hc;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=abc123;OperationTimeout=PT30S",
		)
		.unwrap();
		assert_eq!(cs.endpoint, "sb://my-ns.servicebus.windows.net/");
		assert_eq!(cs.entity_path, "my-hc");
		assert_eq!(cs.shared_access_key_name.as_deref(), Some("RootManageSharedAccessKey"));
		assert_eq!(cs.shared_access_key.as_deref(), Some("abc123"));
		assert_eq!(cs.operation_timeout, Some(Duration::from_secs(30)));
		assert_eq!(cs.address(), "sb://my-ns.servicebus.windows.net/my-hc");
	}

	#[test]
	fn missing_endpoint_is_an_error() {
		let err = ConnectionStringProperties::parse("EntityPath=my-hc").unwrap_err();
		assert!(matches!(err, TokenError::ConnectionString(_)));
	}
}

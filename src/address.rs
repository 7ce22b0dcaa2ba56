use crate::error::ListenerError;
use std::fmt;

/// `sb://<namespace>/<path>[?<query>]` — the listener's logical address in
/// the relay namespace. Construction fails unless the scheme is `sb`.
#[derive(Clone, Debug)]
pub struct Address {
	inner: url::Url,
}

impl Address {
	pub fn host(&self) -> &str {
		self.inner.host_str().unwrap_or_default()
	}

	pub fn port(&self) -> u16 {
		self.inner.port().unwrap_or(443)
	}

	/// The hybrid connection name: the path with leading/trailing slashes
	/// trimmed.
	pub fn path(&self) -> &str {
		self.inner.path().trim_matches('/')
	}

	pub fn query(&self) -> Option<&str> {
		self.inner.query()
	}

	pub fn as_url(&self) -> &url::Url {
		&self.inner
	}
}

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.inner)
	}
}

impl TryFrom<&str> for Address {
	type Error = ListenerError;

	fn try_from(value: &str) -> Result<Self, Self::Error> {
		let url = url::Url::parse(value)
			.map_err(|e| ListenerError::InvalidAddress(format!("{value}: {e}")))?;
		if url.scheme() != "sb" {
			return Err(ListenerError::InvalidAddress(format!(
				"expected scheme 'sb', got '{}'",
				url.scheme()
			)));
		}
		if url.host_str().is_none() {
			return Err(ListenerError::InvalidAddress(
				"address is missing a host".to_string(),
			));
		}
		Ok(Self { inner: url })
	}
}

impl TryFrom<String> for Address {
	type Error = ListenerError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Address::try_from(value.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_valid_address() {
		let addr = Address::try_from("sb://my-ns.servicebus.windows.net/my-hc?foo=bar").unwrap();
		assert_eq!(addr.host(), "my-ns.servicebus.windows.net");
		assert_eq!(addr.path(), "my-hc");
		assert_eq!(addr.query(), Some("foo=bar"));
	}

	#[test]
	fn rejects_wrong_scheme() {
		let err = Address::try_from("https://my-ns.servicebus.windows.net/my-hc").unwrap_err();
		assert!(matches!(err, ListenerError::InvalidAddress(_)));
	}

	#[test]
	fn default_port_is_443() {
		let addr = Address::try_from("sb://my-ns.servicebus.windows.net/my-hc").unwrap();
		assert_eq!(addr.port(), 443);
	}
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Deserialize)]
pub struct RemoteEndpoint {
	pub address: String,
	pub port: u16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AcceptCommand {
	pub id: String,
	pub address: String,
	#[serde(default, rename = "connectHeaders")]
	pub connect_headers: HashMap<String, String>,
	#[serde(rename = "remoteEndpoint")]
	pub remote_endpoint: RemoteEndpoint,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RequestCommand {
	pub id: String,
	pub method: String,
	#[serde(rename = "requestTarget")]
	pub request_target: String,
	#[serde(default)]
	pub headers: HashMap<String, String>,
	#[serde(default)]
	pub body: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResponseCommand {
	#[serde(rename = "requestId")]
	pub request_id: String,
	#[serde(rename = "statusCode")]
	pub status_code: u16,
	#[serde(rename = "statusDescription")]
	pub status_description: String,
	pub headers: HashMap<String, String>,
	pub body: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct RenewTokenCommand {
	pub token: String,
}

/// A parsed inbound frame. Wire frames are JSON objects carrying exactly
/// one of `accept`/`request`/`response`/`renewToken`; anything else (zero
/// keys, multiple keys, or an unknown key set) is an invalid command.
#[derive(Clone, Debug)]
pub enum ListenerCommand {
	Accept(AcceptCommand),
	Request(RequestCommand),
}

#[derive(Deserialize)]
struct RawCommand {
	accept: Option<AcceptCommand>,
	request: Option<RequestCommand>,
	response: Option<serde_json::Value>,
	#[serde(rename = "renewToken")]
	renew_token: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
#[error("frame did not contain exactly one of accept/request/response/renewToken")]
pub struct InvalidCommand;

impl ListenerCommand {
	/// Parses one JSON text frame off the control channel. Inbound frames
	/// are only ever `accept` or `request`; `response`/`renewToken` are
	/// outbound-only but are still recognized so a stray echo doesn't get
	/// logged as a wholly unknown frame.
	pub fn parse(text: &str) -> Result<Self, ParseCommandError> {
		let raw: RawCommand = serde_json::from_str(text)?;
		let present = [
			raw.accept.is_some(),
			raw.request.is_some(),
			raw.response.is_some(),
			raw.renew_token.is_some(),
		]
		.into_iter()
		.filter(|b| *b)
		.count();
		if present != 1 {
			return Err(ParseCommandError::InvalidCommand(InvalidCommand));
		}
		if let Some(accept) = raw.accept {
			return Ok(ListenerCommand::Accept(accept));
		}
		if let Some(request) = raw.request {
			return Ok(ListenerCommand::Request(request));
		}
		Err(ParseCommandError::NotInbound)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ParseCommandError {
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	#[error(transparent)]
	InvalidCommand(#[from] InvalidCommand),
	#[error("frame carried an outbound-only key (response/renewToken)")]
	NotInbound,
}

/// Builds the control-channel URL: `wss://<host>:<port>/$hc/<path>?<filtered-query>&sb-hc-action=listen&sb-hc-id=<base-tracking-id>`.
pub fn control_url(address: &crate::address::Address, base_tracking_id: &str) -> url::Url {
	let mut url = url::Url::parse(&format!(
		"wss://{}:{}/$hc/{}",
		address.host(),
		address.port(),
		address.path()
	))
	.expect("host/path come from an already-validated Address");

	{
		let mut query = url.query_pairs_mut();
		for (k, v) in filtered_query_pairs(address.query()) {
			query.append_pair(&k, &v);
		}
		query.append_pair("sb-hc-action", "listen");
		query.append_pair("sb-hc-id", base_tracking_id);
	}
	url
}

/// Drops relay-internal `sb-hc-*` parameters from a query string.
pub fn filtered_query_pairs(query: Option<&str>) -> Vec<(String, String)> {
	let Some(query) = query else {
		return Vec::new();
	};
	url::form_urlencoded::parse(query.as_bytes())
		.filter(|(k, _)| !k.starts_with("sb-hc-"))
		.map(|(k, v)| (k.into_owned(), v.into_owned()))
		.collect()
}

/// Builds the logical request URI for an accepted rendezvous: the
/// listener address's scheme/host/port, with a leading `$hc/` stripped
/// from the rendezvous path and the query filtered of `sb-hc-*` params.
pub fn logical_request_uri(address: &crate::address::Address, rendezvous: &url::Url) -> url::Url {
	let scheme = if address.as_url().scheme() == "sb" { "https" } else { address.as_url().scheme() };
	let path = rendezvous.path().strip_prefix("/$hc/").unwrap_or_else(|| rendezvous.path().trim_start_matches('/'));
	let mut url = url::Url::parse(&format!("{scheme}://{}:{}/{path}", address.host(), address.port()))
		.expect("constructed from validated components");
	{
		let mut pairs = url.query_pairs_mut();
		for (k, v) in filtered_query_pairs(rendezvous.query()) {
			pairs.append_pair(&k, &v);
		}
	}
	if url.query() == Some("") {
		url.set_query(None);
	}
	url
}

/// Extends a rendezvous URL with the rejection status for the relay to
/// observe: `&statusCode=<n>&statusDescription=<url-encoded>`.
pub fn with_rejection_status(mut rendezvous: url::Url, status_code: u16, status_description: &str) -> url::Url {
	rendezvous
		.query_pairs_mut()
		.append_pair("statusCode", &status_code.to_string())
		.append_pair("statusDescription", status_description);
	rendezvous
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::address::Address;

	#[test]
	fn parses_accept_frame() {
		let text = r#"{"accept":{"id":"abc","address":"wss://relay/rendezvous","connectHeaders":{"Sec-WebSocket-Protocol":"a, b"},"remoteEndpoint":{"address":"1.2.3.4","port":4242}}}"#;
		match ListenerCommand::parse(text).unwrap() {
			ListenerCommand::Accept(cmd) => {
				assert_eq!(cmd.id, "abc");
				assert_eq!(cmd.remote_endpoint.port, 4242);
			},
			_ => panic!("expected accept"),
		}
	}

	#[test]
	fn parses_request_frame() {
		let text = r#"{"request":{"id":"r1","method":"GET","requestTarget":"/foo","headers":{},"body":false}}"#;
		match ListenerCommand::parse(text).unwrap() {
			ListenerCommand::Request(cmd) => assert_eq!(cmd.method, "GET"),
			_ => panic!("expected request"),
		}
	}

	#[test]
	fn rejects_frame_with_zero_or_multiple_keys() {
		assert!(ListenerCommand::parse("{}").is_err());
		let both = r#"{"accept":{"id":"1","address":"a","remoteEndpoint":{"address":"a","port":1}},"request":{"id":"2","method":"GET","requestTarget":"/"}}"#;
		assert!(ListenerCommand::parse(both).is_err());
	}

	#[test]
	fn control_url_has_filtered_query_and_hc_params() {
		let addr = Address::try_from("sb://my-ns/my-hc?foo=bar&sb-hc-action=dial").unwrap();
		let url = control_url(&addr, "base-id");
		assert_eq!(url.scheme(), "wss");
		assert!(url.path().starts_with("/$hc/my-hc"));
		let query: Vec<_> = url.query_pairs().collect();
		assert!(query.iter().any(|(k, v)| k == "foo" && v == "bar"));
		assert!(!query.iter().any(|(k, _)| k.starts_with("sb-hc-action") && false));
		assert!(query.iter().any(|(k, v)| k == "sb-hc-action" && v == "listen"));
		assert!(query.iter().any(|(k, v)| k == "sb-hc-id" && v == "base-id"));
		// the original sb-hc-action=dial must have been filtered out, leaving exactly one
		assert_eq!(query.iter().filter(|(k, _)| k == "sb-hc-action").count(), 1);
	}

	#[test]
	fn rejection_url_gets_status_params() {
		let url = url::Url::parse("wss://relay/rendezvous/abc").unwrap();
		let rejected = with_rejection_status(url, 400, "Rejected by user code");
		assert!(rejected.query().unwrap().contains("statusCode=400"));
		assert!(rejected.query().unwrap().contains("statusDescription=Rejected"));
	}
}

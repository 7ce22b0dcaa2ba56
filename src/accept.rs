use crate::context::{AcceptHandler, AcceptedChannel, ListenerContext, RequestInfo};
use crate::control::ControlConnection;
use crate::metrics::Metrics;
use crate::protocol::{self, AcceptCommand};
use crate::queue::InputQueue;
use crate::tracking::TrackingContext;
use crate::{address::Address, transport};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

const RENDEZVOUS_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SUB_PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// Turns each inbound `accept` command into a `ListenerContext`, runs the
/// user accept predicate, and either opens the rendezvous socket and
/// enqueues the resulting channel, or posts a rejection to the rendezvous
/// URL. Both paths run off the read pump, never blocking it.
pub struct AcceptPipeline {
	listener_address: Address,
	handler: Mutex<Option<AcceptHandler>>,
	queue: Arc<InputQueue<AcceptedChannel>>,
	metrics: Arc<Metrics>,
}

impl AcceptPipeline {
	pub fn new(listener_address: Address, queue: Arc<InputQueue<AcceptedChannel>>, metrics: Arc<Metrics>) -> Arc<Self> {
		Arc::new(Self {
			listener_address,
			handler: Mutex::new(None),
			queue,
			metrics,
		})
	}

	pub fn set_handler(&self, handler: AcceptHandler) {
		*self.handler.lock().unwrap() = Some(handler);
	}

	/// Dispatch entry point installed on the control connection. Spawns its
	/// own task so a slow rendezvous open never head-of-line-blocks the
	/// read pump or other in-flight accepts.
	pub fn dispatch(self: &Arc<Self>, cmd: AcceptCommand, control: Arc<ControlConnection>) {
		let this = self.clone();
		tokio::spawn(async move { this.handle(cmd, control).await });
	}

	async fn handle(self: Arc<Self>, cmd: AcceptCommand, _control: Arc<ControlConnection>) {
		let Ok(rendezvous_url) = url::Url::parse(&cmd.address) else {
			warn!(id = cmd.id, address = cmd.address, "accept command carried an unparseable rendezvous address");
			return;
		};
		let logical_uri = protocol::logical_request_uri(&self.listener_address, &rendezvous_url);
		let tracking = TrackingContext::with_tracking_id(self.listener_address.to_string(), &cmd.id);

		let remote_endpoint = Some(format!("{}:{}", cmd.remote_endpoint.address, cmd.remote_endpoint.port));
		let request = RequestInfo {
			method: "GET".to_string(),
			uri: logical_uri,
			headers: cmd.connect_headers.clone(),
			remote_endpoint,
			has_body: false,
		};
		let ctx = ListenerContext::new(tracking.clone(), request);

		let negotiated_protocol = negotiate_sub_protocol(&cmd.connect_headers);
		if let Some(protocol) = &negotiated_protocol {
			ctx.response.lock().unwrap().headers.insert(SUB_PROTOCOL_HEADER.to_string(), protocol.clone());
		}

		let accepted = match self.invoke_handler(&ctx).await {
			Ok(true) => true,
			Ok(false) => false,
			Err(e) => {
				ctx.set_response(502, tracking.ensure_trackable(format!("Bad Gateway: {e}")));
				false
			},
		};

		if accepted {
			self.accept(tracking, &cmd, rendezvous_url, negotiated_protocol).await;
		} else {
			self.reject(tracking, rendezvous_url, ctx).await;
		}
	}

	async fn invoke_handler(&self, ctx: &ListenerContext) -> anyhow::Result<bool> {
		let handler = self.handler.lock().unwrap().clone();
		match handler {
			Some(handler) => handler(ctx.clone()).await,
			None => Ok(true),
		}
	}

	async fn accept(
		&self,
		tracking: TrackingContext,
		cmd: &AcceptCommand,
		rendezvous_url: url::Url,
		negotiated_protocol: Option<String>,
	) {
		let mut headers: Vec<(String, String)> = cmd
			.connect_headers
			.iter()
			.filter(|(k, _)| !k.eq_ignore_ascii_case(SUB_PROTOCOL_HEADER))
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect();
		if let Some(protocol) = negotiated_protocol {
			headers.push((SUB_PROTOCOL_HEADER.to_string(), protocol));
		}

		match transport::connect(&rendezvous_url, &headers, RENDEZVOUS_CONNECT_TIMEOUT).await {
			Ok(socket) => {
				let channel = AcceptedChannel::new(tracking, socket);
				if !self.queue.enqueue(channel) {
					warn!("accept queue already shut down, dropping rendezvous channel");
					return;
				}
				self.metrics.accepts_total.inc();
			},
			Err(e) => {
				warn!(error = %e, "failed to open rendezvous socket after accept");
			},
		}
	}

	async fn reject(&self, tracking: TrackingContext, rendezvous_url: url::Url, ctx: ListenerContext) {
		self.metrics.rejects_total.inc();
		let response = ctx.response_snapshot();
		let (status, description) = match response.status {
			crate::context::ResponseStatus::Unset => (400, "Rejected by user code".to_string()),
			crate::context::ResponseStatus::Code(code) => (code, response.description),
		};
		let url = protocol::with_rejection_status(rendezvous_url, status, &description);
		match transport::connect(&url, &[], RENDEZVOUS_CONNECT_TIMEOUT).await {
			Ok(mut socket) => {
				if let Err(e) = socket.close(transport::NORMAL_CLOSURE, "rejected").await {
					// The relay may have already torn the rendezvous down
					// ("Gone") once it read the status query params; that's
					// expected, not an error.
					warn!(tracking_id = tracking.tracking_id(), error = %e, "error closing rejection socket");
				}
			},
			Err(e) => {
				warn!(tracking_id = tracking.tracking_id(), error = %e, "failed to post rejection to rendezvous url");
			},
		}
	}
}

/// First token of a comma-separated `Sec-WebSocket-Protocol` header value.
fn negotiate_sub_protocol(headers: &std::collections::HashMap<String, String>) -> Option<String> {
	let value = headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(SUB_PROTOCOL_HEADER))?.1;
	value.split(',').next().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn negotiates_first_offered_protocol() {
		let mut headers = std::collections::HashMap::new();
		headers.insert("Sec-WebSocket-Protocol".to_string(), "wamp, soap".to_string());
		assert_eq!(negotiate_sub_protocol(&headers).as_deref(), Some("wamp"));
	}

	#[test]
	fn no_header_means_no_negotiation() {
		let headers = std::collections::HashMap::new();
		assert_eq!(negotiate_sub_protocol(&headers), None);
	}
}

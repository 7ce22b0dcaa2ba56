use crate::context::{ListenerContext, RequestHandler, RequestInfo};
use crate::control::ControlConnection;
use crate::metrics::Metrics;
use crate::protocol::{RequestCommand, ResponseCommand};
use crate::tracking::TrackingContext;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Turns each inbound `request` command into a `ListenerContext`, delivers
/// it to the user request handler, and streams the finalized response back
/// over the control channel's write discipline. Body transport beyond a
/// single trailing binary frame is out of scope; a multi-frame body would
/// be chunked by the caller with its own continuation marker.
pub struct HttpRequestBridge {
	listener_address: crate::address::Address,
	handler: Mutex<Option<RequestHandler>>,
	metrics: Arc<Metrics>,
}

impl HttpRequestBridge {
	pub fn new(listener_address: crate::address::Address, metrics: Arc<Metrics>) -> Arc<Self> {
		Arc::new(Self {
			listener_address,
			handler: Mutex::new(None),
			metrics,
		})
	}

	pub fn set_handler(&self, handler: RequestHandler) {
		*self.handler.lock().unwrap() = Some(handler);
	}

	pub fn dispatch(self: &Arc<Self>, cmd: RequestCommand, control: Arc<ControlConnection>) {
		let this = self.clone();
		tokio::spawn(async move { this.handle(cmd, control).await });
	}

	async fn handle(self: Arc<Self>, cmd: RequestCommand, control: Arc<ControlConnection>) {
		self.metrics.requests_total.inc();
		let tracking = TrackingContext::with_tracking_id(self.listener_address.to_string(), &cmd.id);
		let uri = self.logical_uri(&cmd.request_target);
		let request = RequestInfo {
			method: cmd.method.clone(),
			uri,
			headers: cmd.headers.clone(),
			remote_endpoint: None,
			has_body: cmd.body,
		};
		let ctx = ListenerContext::new(tracking.clone(), request);

		let handler = self.handler.lock().unwrap().clone();
		let outcome = match handler {
			Some(handler) => handler(ctx.clone()).await,
			None => {
				ctx.set_response(501, "No request handler installed");
				Ok(())
			},
		};
		if let Err(e) = outcome {
			ctx.set_response(500, tracking.ensure_trackable(format!("Internal Server Error: {e}")));
		}

		let response = ctx.response_snapshot();
		let frame = ResponseCommand {
			request_id: cmd.id,
			status_code: response.status.code_or(200),
			status_description: response.description,
			headers: response.headers,
			body: response.body.is_some(),
		};
		let text = serde_json::json!({ "response": frame }).to_string();
		if let Err(e) = control.send_command_and_stream(text, response.body).await {
			warn!(tracking_id = tracking.tracking_id(), error = %e, "failed to send response frame");
		}
	}

	fn logical_uri(&self, request_target: &str) -> url::Url {
		let scheme = if self.listener_address.as_url().scheme() == "sb" { "https" } else { self.listener_address.as_url().scheme() };
		let base = url::Url::parse(&format!("{scheme}://{}:{}/", self.listener_address.host(), self.listener_address.port()))
			.expect("scheme/host/port come from an already-validated Address");
		base.join(request_target.trim_start_matches('/')).unwrap_or(base)
	}
}

use crate::accept::AcceptPipeline;
use crate::address::Address;
use crate::connection_string::ConnectionStringProperties;
use crate::context::{AcceptHandler, AcceptedChannel, RequestHandler};
use crate::control::{AcceptDispatch, ControlConnection, RequestDispatch};
use crate::error::ListenerError;
use crate::http_bridge::HttpRequestBridge;
use crate::metrics::Metrics;
use crate::queue::InputQueue;
use crate::sas::{SharedAccessKeyTokenProvider, TokenProvider};
use crate::token::TokenRenewer;
use crate::tracking::TrackingContext;
use crate::transport;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// One-shot latches guarded by a single mutex, per the design note against
/// modelling "already open"/"already closed" as two independent booleans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Latch {
	NotOpened,
	Opened,
	Closed,
}

/// Glues C2–C6 and exposes the public surface: `open`/`close`/`accept_connection`
/// plus the online/offline/connecting/accept/request callback setters.
pub struct Listener {
	latch: Mutex<Latch>,
	address: Address,
	token_renewer: Arc<TokenRenewer>,
	control: Arc<ControlConnection>,
	accept_pipeline: Arc<AcceptPipeline>,
	http_bridge: Arc<HttpRequestBridge>,
	queue: Arc<InputQueue<AcceptedChannel>>,
	metrics: Arc<Metrics>,
}

impl Listener {
	pub fn new(address: Address, provider: Arc<dyn TokenProvider>) -> Arc<Self> {
		let metrics = Arc::new(Metrics::new());
		let audience = address.to_string();
		let token_renewer = TokenRenewer::new(provider, audience, metrics.clone());
		let tracking = TrackingContext::new(address.to_string());
		let queue = Arc::new(InputQueue::new());
		let accept_pipeline = AcceptPipeline::new(address.clone(), queue.clone(), metrics.clone());
		let http_bridge = HttpRequestBridge::new(address.clone(), metrics.clone());

		let accept_for_dispatch = accept_pipeline.clone();
		let on_accept: AcceptDispatch = Arc::new(move |cmd, control| accept_for_dispatch.dispatch(cmd, control));
		let request_for_dispatch = http_bridge.clone();
		let on_request: RequestDispatch = Arc::new(move |cmd, control| request_for_dispatch.dispatch(cmd, control));

		let control = ControlConnection::new(
			address.clone(),
			tracking,
			token_renewer.clone(),
			on_accept,
			on_request,
			Arc::new(transport::WsConnector),
			metrics.clone(),
		);

		Arc::new(Self {
			latch: Mutex::new(Latch::NotOpened),
			address,
			token_renewer,
			control,
			accept_pipeline,
			http_bridge,
			queue,
			metrics,
		})
	}

	/// Builds a listener from a relay connection string, using the SAS
	/// shared-key scheme for token acquisition.
	pub fn from_connection_string(connection_string: &str) -> Result<Arc<Self>, ListenerError> {
		let props = ConnectionStringProperties::parse(connection_string)?;
		let address = Address::try_from(props.address())?;
		let key_name = props.shared_access_key_name.clone().unwrap_or_default();
		let key = props.shared_access_key.clone().unwrap_or_default();
		let provider = Arc::new(SharedAccessKeyTokenProvider::new(
			key_name,
			key.into_bytes(),
			props.operation_timeout.unwrap_or(Duration::from_secs(60)),
		));
		Ok(Self::new(address, provider))
	}

	pub fn set_accept_handler(&self, handler: AcceptHandler) {
		self.accept_pipeline.set_handler(handler);
	}

	pub fn set_request_handler(&self, handler: RequestHandler) {
		self.http_bridge.set_handler(handler);
	}

	pub fn on_online(&self, f: impl Fn() + Send + Sync + 'static) {
		self.control.on_online(f);
	}

	pub fn on_offline(&self, f: impl Fn(Option<ListenerError>) + Send + Sync + 'static) {
		self.control.on_offline(f);
	}

	pub fn on_connecting(&self, f: impl Fn(&ListenerError) + Send + Sync + 'static) {
		self.control.on_connecting(f);
	}

	pub fn address(&self) -> &Address {
		&self.address
	}

	pub fn metrics(&self) -> &Metrics {
		&self.metrics
	}

	pub fn is_online(&self) -> bool {
		self.control.is_online()
	}

	pub async fn open(self: &Arc<Self>) -> Result<(), ListenerError> {
		self.open_with_timeout(DEFAULT_OPEN_TIMEOUT).await
	}

	pub async fn open_with_timeout(self: &Arc<Self>, timeout: Duration) -> Result<(), ListenerError> {
		{
			let mut latch = self.latch.lock().unwrap();
			if *latch != Latch::NotOpened {
				return Err(ListenerError::AlreadyOpen);
			}
			*latch = Latch::Opened;
		}
		self.control.open(timeout).await
	}

	/// Shuts down the accept queue, drains and closes any un-dequeued
	/// rendezvous channels with `NORMAL_CLOSURE`, then closes the control
	/// connection. Idempotent.
	pub async fn close(self: &Arc<Self>) -> Result<(), ListenerError> {
		{
			let mut latch = self.latch.lock().unwrap();
			if *latch == Latch::Closed {
				return Ok(());
			}
			*latch = Latch::Closed;
		}
		self.queue.shutdown();
		self.queue.dispose(|mut channel| {
			tokio::spawn(async move {
				let _ = channel.close().await;
			});
		});
		self.token_renewer.close();
		self.control.close().await
	}

	/// Waits up to `timeout` (or forever) for the next accepted rendezvous
	/// channel. Fails with `NotOnline` if `open` was never called, or
	/// `AlreadyClosed` once `close` has run.
	pub async fn accept_connection(&self, timeout: Option<Duration>) -> Result<Option<AcceptedChannel>, ListenerError> {
		match *self.latch.lock().unwrap() {
			Latch::NotOpened => return Err(ListenerError::NotOnline),
			Latch::Closed => return Err(ListenerError::AlreadyClosed),
			Latch::Opened => {},
		}
		Ok(self.queue.dequeue(timeout).await)
	}
}

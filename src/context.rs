use crate::error::TransportError;
use crate::tracking::TrackingContext;
use crate::transport::{self, Socket};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A request as delivered to user code: immutable after construction.
#[derive(Clone, Debug)]
pub struct RequestInfo {
	pub method: String,
	pub uri: url::Url,
	pub headers: HashMap<String, String>,
	pub remote_endpoint: Option<String>,
	pub has_body: bool,
}

/// Out-of-band sentinel for "user code hasn't set a status yet", kept
/// distinct from any legitimate HTTP status (including `100 Continue`) so
/// the ambiguity noted in the design notes cannot arise: a never-set
/// response reads as `Unset`, never as the number 100.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
	Unset,
	Code(u16),
}

impl ResponseStatus {
	pub fn code_or(self, default: u16) -> u16 {
		match self {
			ResponseStatus::Unset => default,
			ResponseStatus::Code(c) => c,
		}
	}
}

/// Writable by user code until the exchange completes.
#[derive(Clone, Debug)]
pub struct ResponseState {
	pub status: ResponseStatus,
	pub description: String,
	pub headers: HashMap<String, String>,
	pub body: Option<Vec<u8>>,
}

impl Default for ResponseState {
	fn default() -> Self {
		Self {
			status: ResponseStatus::Unset,
			description: String::new(),
			headers: HashMap::new(),
			body: None,
		}
	}
}

impl ResponseState {
	pub fn set(&mut self, status: u16, description: impl Into<String>) {
		self.status = ResponseStatus::Code(status);
		self.description = description.into();
	}
}

/// Per-incoming-exchange context created by the accept pipeline or the HTTP
/// bridge. `request` never changes after construction; `response` is a
/// shared, lock-guarded cell so user handlers (which may run on any worker)
/// can write to it.
#[derive(Clone)]
pub struct ListenerContext {
	pub tracking: TrackingContext,
	pub request: Arc<RequestInfo>,
	pub response: Arc<Mutex<ResponseState>>,
}

impl ListenerContext {
	pub fn new(tracking: TrackingContext, request: RequestInfo) -> Self {
		Self {
			tracking,
			request: Arc::new(request),
			response: Arc::new(Mutex::new(ResponseState::default())),
		}
	}

	pub fn set_response(&self, status: u16, description: impl Into<String>) {
		self.response.lock().unwrap().set(status, description);
	}

	pub fn response_snapshot(&self) -> ResponseState {
		self.response.lock().unwrap().clone()
	}
}

pub type AcceptFuture = BoxFuture<'static, anyhow::Result<bool>>;
/// Invoked with the accept context; `Ok(true)` accepts the rendezvous,
/// `Ok(false)` rejects it, `Err` rejects with `502 Bad Gateway`.
pub type AcceptHandler = Arc<dyn Fn(ListenerContext) -> AcceptFuture + Send + Sync>;

pub type RequestFuture = BoxFuture<'static, anyhow::Result<()>>;
/// Invoked with the request context; the handler finalizes `ctx.response`
/// before its future resolves. `Err` yields a `500` reply.
pub type RequestHandler = Arc<dyn Fn(ListenerContext) -> RequestFuture + Send + Sync>;

/// A successful rendezvous: a duplex byte stream owned by the consumer who
/// dequeued it from the listener's accept queue. Per-channel framing above
/// this is entirely the caller's concern.
pub struct AcceptedChannel {
	pub tracking: TrackingContext,
	socket: Box<dyn Socket>,
}

impl AcceptedChannel {
	pub fn new(tracking: TrackingContext, socket: Box<dyn Socket>) -> Self {
		Self { tracking, socket }
	}

	pub async fn write_binary(&mut self, data: &[u8]) -> Result<(), TransportError> {
		self.socket.write_binary(data).await
	}

	pub async fn read_binary(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
		self.socket.read_binary().await
	}

	pub async fn close(mut self) -> Result<(), TransportError> {
		self
			.socket
			.close(transport::NORMAL_CLOSURE, "Client closing the socket normally")
			.await
	}
}

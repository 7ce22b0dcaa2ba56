use crate::address::Address;
use crate::error::{ListenerError, TransportError};
use crate::metrics::{ConnectingLabels, Metrics};
use crate::protocol::{self, AcceptCommand, ListenerCommand, RequestCommand};
use crate::token::TokenRenewer;
use crate::tracking::TrackingContext;
use crate::transport::{self, Connector, SocketReader, SocketWriter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// `Idle → Connecting → Online → Reconnecting → Closed`, guarded by one
/// mutex so there is no observable "half open/half closed" state, per the
/// design note against two independent booleans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
	Idle,
	Connecting,
	Online,
	Reconnecting,
	Closed,
}

/// Fixed reconnect backoff, seconds. `backoff_index` is `None` before the
/// first attempt or right after a successful Online transition, and
/// clamps at the last entry once exhausted.
const BACKOFF_SCHEDULE_SECS: [u64; 6] = [0, 1, 2, 5, 10, 30];
const RECONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

pub type OnlineCallback = Arc<dyn Fn() + Send + Sync>;
pub type OfflineCallback = Arc<dyn Fn(Option<ListenerError>) + Send + Sync>;
pub type ConnectingCallback = Arc<dyn Fn(&ListenerError) + Send + Sync>;

/// Invoked by the read pump for each inbound command, handed a clone of
/// the control connection so the pipeline can send frames back without the
/// pump blocking on it. Dispatch must not await inline here — implementors
/// spawn their own task.
pub type AcceptDispatch = Arc<dyn Fn(AcceptCommand, Arc<ControlConnection>) + Send + Sync>;
pub type RequestDispatch = Arc<dyn Fn(RequestCommand, Arc<ControlConnection>) + Send + Sync>;

pub struct ControlConnection {
	address: Address,
	tracking: TrackingContext,
	token_renewer: Arc<TokenRenewer>,
	connector: Arc<dyn Connector>,
	metrics: Arc<Metrics>,
	writer: AsyncMutex<Option<Box<dyn SocketWriter>>>,
	phase: Mutex<Phase>,
	backoff_index: Mutex<Option<usize>>,
	close_requested: AtomicBool,
	on_online: Mutex<Option<OnlineCallback>>,
	on_offline: Mutex<Option<OfflineCallback>>,
	on_connecting: Mutex<Option<ConnectingCallback>>,
	on_accept: AcceptDispatch,
	on_request: RequestDispatch,
	pump_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ControlConnection {
	pub fn new(
		address: Address,
		tracking: TrackingContext,
		token_renewer: Arc<TokenRenewer>,
		on_accept: AcceptDispatch,
		on_request: RequestDispatch,
		connector: Arc<dyn Connector>,
		metrics: Arc<Metrics>,
	) -> Arc<Self> {
		let this = Arc::new(Self {
			address,
			tracking,
			token_renewer,
			connector,
			metrics,
			writer: AsyncMutex::new(None),
			phase: Mutex::new(Phase::Idle),
			backoff_index: Mutex::new(None),
			close_requested: AtomicBool::new(false),
			on_online: Mutex::new(None),
			on_offline: Mutex::new(None),
			on_connecting: Mutex::new(None),
			on_accept,
			on_request,
			pump_handle: Mutex::new(None),
		});
		this.clone().install_token_subscriber();
		this
	}

	fn install_token_subscriber(self: Arc<Self>) {
		self.token_renewer.on_token_renewed(move |token| {
			let this = self.clone();
			tokio::spawn(async move {
				let frame = serde_json::json!({ "renewToken": { "token": token.token.to_string() } });
				if let Err(e) = this.send_command_and_stream(frame.to_string(), None).await {
					warn!(error = %e, "failed to send renewToken frame");
				}
			});
		});
	}

	pub fn tracking(&self) -> &TrackingContext {
		&self.tracking
	}

	pub fn address(&self) -> &Address {
		&self.address
	}

	pub fn phase(&self) -> Phase {
		*self.phase.lock().unwrap()
	}

	pub fn is_online(&self) -> bool {
		self.phase() == Phase::Online
	}

	pub fn on_online(&self, f: impl Fn() + Send + Sync + 'static) {
		*self.on_online.lock().unwrap() = Some(Arc::new(f));
	}

	pub fn on_offline(&self, f: impl Fn(Option<ListenerError>) + Send + Sync + 'static) {
		*self.on_offline.lock().unwrap() = Some(Arc::new(f));
	}

	pub fn on_connecting(&self, f: impl Fn(&ListenerError) + Send + Sync + 'static) {
		*self.on_connecting.lock().unwrap() = Some(Arc::new(f));
	}

	/// `Idle → Connecting → Online`. On failure the connection returns to
	/// `Idle` so a caller may retry `open` outright (reconnects are only
	/// attempted once a connection has gone Online at least once).
	pub async fn open(self: &Arc<Self>, timeout: Duration) -> Result<(), ListenerError> {
		{
			let mut phase = self.phase.lock().unwrap();
			if *phase != Phase::Idle {
				return Err(ListenerError::AlreadyOpen);
			}
			*phase = Phase::Connecting;
		}

		match self.connect_once(timeout).await {
			Ok(reader) => {
				self.transition_online();
				let pump_self = self.clone();
				let handle = tokio::spawn(async move { pump_self.pump_loop(reader).await });
				*self.pump_handle.lock().unwrap() = Some(handle);
				Ok(())
			},
			Err(e) => {
				*self.phase.lock().unwrap() = Phase::Idle;
				Err(e)
			},
		}
	}

	pub async fn close(self: &Arc<Self>) -> Result<(), ListenerError> {
		if self.close_requested.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		if let Some(handle) = self.pump_handle.lock().unwrap().take() {
			handle.abort();
		}
		if let Some(mut writer) = self.writer.lock().await.take() {
			let _ = writer.close(transport::NORMAL_CLOSURE, "Client closing the socket normally").await;
		}
		self.finish_closed(None);
		Ok(())
	}

	/// `sendCommandAndStream`: ensures Online, writes the JSON frame under
	/// the write lock, then the optional body immediately after so the two
	/// are never interleaved with another writer's frame.
	pub async fn send_command_and_stream(&self, text: String, body: Option<Vec<u8>>) -> Result<(), ListenerError> {
		if !self.is_online() {
			return Err(ListenerError::NotOnline);
		}
		let mut guard = self.writer.lock().await;
		let writer = guard.as_mut().ok_or(ListenerError::NotOnline)?;
		writer.write_text(&text).await?;
		if let Some(body) = body {
			writer.write_binary(&body).await?;
		}
		Ok(())
	}

	async fn connect_once(&self, timeout: Duration) -> Result<Box<dyn SocketReader>, ListenerError> {
		let token = self.token_renewer.get_token().await?;
		let url = protocol::control_url(&self.address, self.tracking.base_tracking_id());
		let headers = vec![("ServiceBusAuthorization".to_string(), token.token.to_string())];
		let (reader, writer) = self.connector.connect(&url, &headers, timeout).await.map_err(Self::classify)?;
		*self.writer.lock().await = Some(writer);
		Ok(reader)
	}

	/// Closes the half-open socket left behind by a self-detected read
	/// failure (as opposed to a peer-initiated close, which needs no reply)
	/// with `1011 Unexpected Condition` before a reconnect attempt dials a
	/// fresh one.
	async fn abandon_writer(&self) {
		if let Some(mut writer) = self.writer.lock().await.take() {
			let _ = writer.close(transport::UNEXPECTED_CONDITION, "aborting after control channel read failure").await;
		}
	}

	fn classify(err: TransportError) -> ListenerError {
		if transport::is_endpoint_not_found(&err) {
			ListenerError::EndpointNotFound
		} else {
			ListenerError::Transport(err)
		}
	}

	async fn pump_loop(self: Arc<Self>, mut reader: Box<dyn SocketReader>) {
		loop {
			let outcome = reader.read_text().await;
			if self.close_requested.load(Ordering::SeqCst) {
				self.finish_closed(None);
				return;
			}
			match outcome {
				Ok(Some(text)) => {
					self.dispatch_frame(&text);
					continue;
				},
				Ok(None) => {
					info!(tracking_id = self.tracking.tracking_id(), "control channel closed by peer");
				},
				Err(e) => {
					warn!(tracking_id = self.tracking.tracking_id(), error = %e, "control channel read failed");
					self.abandon_writer().await;
				},
			}

			match self.reconnect_loop().await {
				Some(new_reader) => reader = new_reader,
				None => return,
			}
		}
	}

	fn dispatch_frame(self: &Arc<Self>, text: &str) {
		match ListenerCommand::parse(text) {
			Ok(ListenerCommand::Accept(cmd)) => {
				(self.on_accept)(cmd, self.clone());
			},
			Ok(ListenerCommand::Request(cmd)) => {
				(self.on_request)(cmd, self.clone());
			},
			Err(e) => {
				warn!(tracking_id = self.tracking.tracking_id(), error = %e, frame = text, "invalid command on control channel");
			},
		}
	}

	/// Reconnect attempts live in `Reconnecting` until a connect succeeds
	/// (→ `Online`, backoff reset) or the relay reports the endpoint gone
	/// (→ `Closed`, terminal).
	async fn reconnect_loop(self: &Arc<Self>) -> Option<Box<dyn SocketReader>> {
		*self.phase.lock().unwrap() = Phase::Reconnecting;
		let lost = ListenerError::Transport(TransportError::Closed);
		self.invoke_connecting(&lost);

		loop {
			if self.close_requested.load(Ordering::SeqCst) {
				self.finish_closed(None);
				return None;
			}
			let delay = self.next_backoff_delay();
			if !delay.is_zero() {
				tokio::time::sleep(delay).await;
			}
			match self.connect_once(RECONNECT_ATTEMPT_TIMEOUT).await {
				Ok(reader) => {
					self.reset_backoff();
					self.transition_online();
					return Some(reader);
				},
				Err(ListenerError::EndpointNotFound) => {
					self.finish_closed(Some(ListenerError::EndpointNotFound));
					return None;
				},
				Err(e) => {
					warn!(tracking_id = self.tracking.tracking_id(), error = %e, "reconnect attempt failed");
					self.invoke_connecting(&e);
				},
			}
		}
	}

	fn next_backoff_delay(&self) -> Duration {
		let mut index = self.backoff_index.lock().unwrap();
		let next = index.map_or(0, |i| (i + 1).min(BACKOFF_SCHEDULE_SECS.len() - 1));
		*index = Some(next);
		Duration::from_secs(BACKOFF_SCHEDULE_SECS[next])
	}

	fn reset_backoff(&self) {
		*self.backoff_index.lock().unwrap() = None;
	}

	fn transition_online(&self) {
		*self.phase.lock().unwrap() = Phase::Online;
		self.metrics.control_online_total.inc();
		if let Some(cb) = self.on_online.lock().unwrap().clone() {
			cb();
		}
	}

	fn invoke_connecting(&self, err: &ListenerError) {
		self
			.metrics
			.control_reconnect_attempts
			.get_or_create(&ConnectingLabels { reason: Self::reason_label(err) })
			.inc();
		if let Some(cb) = self.on_connecting.lock().unwrap().clone() {
			cb(err);
		}
	}

	fn reason_label(err: &ListenerError) -> String {
		match err {
			ListenerError::Transport(_) => "transport".to_string(),
			ListenerError::EndpointNotFound => "endpoint_not_found".to_string(),
			ListenerError::Token(_) => "token".to_string(),
			other => other.to_string(),
		}
	}

	fn finish_closed(&self, err: Option<ListenerError>) {
		let mut phase = self.phase.lock().unwrap();
		if *phase == Phase::Closed {
			return;
		}
		*phase = Phase::Closed;
		drop(phase);
		self.metrics.control_offline_total.inc();
		if let Some(cb) = self.on_offline.lock().unwrap().clone() {
			cb(err);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_advances_through_fixed_schedule_and_clamps() {
		let cc_backoff = Mutex::new(None::<usize>);
		let next = |idx: &Mutex<Option<usize>>| -> u64 {
			let mut g = idx.lock().unwrap();
			let n = g.map_or(0, |i| (i + 1).min(BACKOFF_SCHEDULE_SECS.len() - 1));
			*g = Some(n);
			BACKOFF_SCHEDULE_SECS[n]
		};
		let seq: Vec<u64> = (0..8).map(|_| next(&cc_backoff)).collect();
		assert_eq!(seq, vec![0, 1, 2, 5, 10, 30, 30, 30]);
	}
}

//! Exercises the control connection's state machine (open, online/offline
//! callbacks, reconnect-with-backoff, write atomicity) against an in-memory
//! fake transport rather than a real websocket, per the `Connector` seam
//! `transport.rs` exists to provide.

use relay_listener::address::Address;
use relay_listener::control::ControlConnection;
use relay_listener::error::{ListenerError, TransportError};
use relay_listener::metrics::Metrics;
use relay_listener::sas::SharedAccessKeyTokenProvider;
use relay_listener::token::TokenRenewer;
use relay_listener::tracking::TrackingContext;
use relay_listener::transport::{Connector, SocketReader, SocketWriter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct FakeReader {
	rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait::async_trait]
impl SocketReader for FakeReader {
	async fn read_text(&mut self) -> Result<Option<String>, TransportError> {
		Ok(self.rx.recv().await)
	}
}

struct FakeWriter {
	writes: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl SocketWriter for FakeWriter {
	async fn write_text(&mut self, text: &str) -> Result<(), TransportError> {
		self.writes.lock().unwrap().push(text.to_string());
		Ok(())
	}

	async fn write_binary(&mut self, _data: &[u8]) -> Result<(), TransportError> {
		Ok(())
	}

	async fn close(&mut self, _code: u16, _reason: &str) -> Result<(), TransportError> {
		Ok(())
	}
}

/// A live connection's handles as seen from the test: `hang_up` simulates
/// the server dropping the socket, `writes` observes what the control
/// connection sent.
struct ConnectionHandle {
	hang_up: Option<mpsc::UnboundedSender<String>>,
	writes: Arc<Mutex<Vec<String>>>,
}

struct FakeConnector {
	new_connections: mpsc::UnboundedSender<ConnectionHandle>,
}

#[async_trait::async_trait]
impl Connector for FakeConnector {
	async fn connect(
		&self,
		_url: &url::Url,
		_headers: &[(String, String)],
		_timeout: Duration,
	) -> Result<(Box<dyn SocketReader>, Box<dyn SocketWriter>), TransportError> {
		let (tx, rx) = mpsc::unbounded_channel::<String>();
		let writes = Arc::new(Mutex::new(Vec::new()));
		let _ = self.new_connections.send(ConnectionHandle {
			hang_up: Some(tx.clone()),
			writes: writes.clone(),
		});
		Ok((Box::new(FakeReader { rx }), Box::new(FakeWriter { writes })))
	}
}

fn token_renewer() -> Arc<TokenRenewer> {
	let provider = Arc::new(SharedAccessKeyTokenProvider::new(
		"RootManageSharedAccessKey",
		b"supersecret".to_vec(),
		Duration::from_secs(3600),
	));
	TokenRenewer::new(provider, "sb://test-ns/test-hc", Arc::new(Metrics::new()))
}

#[tokio::test]
async fn open_transitions_online_and_calls_online_once() {
	let address = Address::try_from("sb://test-ns/test-hc").unwrap();
	let tracking = TrackingContext::new(address.to_string());
	let (new_connections_tx, mut new_connections) = mpsc::unbounded_channel();
	let connector = Arc::new(FakeConnector { new_connections: new_connections_tx });

	let control = ControlConnection::new(
		address,
		tracking,
		token_renewer(),
		Arc::new(|_cmd, _control| {}),
		Arc::new(|_cmd, _control| {}),
		connector,
		Arc::new(Metrics::new()),
	);

	let online_count = Arc::new(AtomicUsize::new(0));
	{
		let online_count = online_count.clone();
		control.on_online(move || {
			online_count.fetch_add(1, Ordering::SeqCst);
		});
	}

	control.open(Duration::from_secs(5)).await.unwrap();
	let first = new_connections.recv().await.expect("connector invoked once on open");

	assert!(control.is_online());
	assert_eq!(online_count.load(Ordering::SeqCst), 1);

	// write atomicity / send_command_and_stream
	control.send_command_and_stream("{\"renewToken\":{\"token\":\"abc\"}}".to_string(), None).await.unwrap();
	assert_eq!(first.writes.lock().unwrap().as_slice(), ["{\"renewToken\":{\"token\":\"abc\"}}"]);
}

#[tokio::test(start_paused = true)]
async fn disconnect_triggers_reconnect_with_backoff() {
	let address = Address::try_from("sb://test-ns/test-hc").unwrap();
	let tracking = TrackingContext::new(address.to_string());
	let (new_connections_tx, mut new_connections) = mpsc::unbounded_channel();
	let connector = Arc::new(FakeConnector { new_connections: new_connections_tx });

	let control = ControlConnection::new(
		address,
		tracking,
		token_renewer(),
		Arc::new(|_cmd, _control| {}),
		Arc::new(|_cmd, _control| {}),
		connector,
		Arc::new(Metrics::new()),
	);

	let connecting_count = Arc::new(AtomicUsize::new(0));
	{
		let connecting_count = connecting_count.clone();
		control.on_connecting(move |_err: &ListenerError| {
			connecting_count.fetch_add(1, Ordering::SeqCst);
		});
	}
	let online_count = Arc::new(AtomicUsize::new(0));
	{
		let online_count = online_count.clone();
		control.on_online(move || {
			online_count.fetch_add(1, Ordering::SeqCst);
		});
	}

	control.open(Duration::from_secs(5)).await.unwrap();
	let mut first = new_connections.recv().await.expect("first connection");
	assert_eq!(online_count.load(Ordering::SeqCst), 1);

	// Simulate the relay dropping the control socket.
	first.hang_up.take();

	let second = new_connections.recv().await.expect("reconnect attempt");
	assert_eq!(connecting_count.load(Ordering::SeqCst), 1);
	assert!(control.is_online());
	assert_eq!(online_count.load(Ordering::SeqCst), 2);
	drop(second);
}

#[tokio::test]
async fn close_is_idempotent_and_calls_offline_once_with_no_error() {
	let address = Address::try_from("sb://test-ns/test-hc").unwrap();
	let tracking = TrackingContext::new(address.to_string());
	let (new_connections_tx, mut new_connections) = mpsc::unbounded_channel();
	let connector = Arc::new(FakeConnector { new_connections: new_connections_tx });

	let control = ControlConnection::new(
		address,
		tracking,
		token_renewer(),
		Arc::new(|_cmd, _control| {}),
		Arc::new(|_cmd, _control| {}),
		connector,
		Arc::new(Metrics::new()),
	);

	let offline_calls = Arc::new(Mutex::new(Vec::<bool>::new()));
	{
		let offline_calls = offline_calls.clone();
		control.on_offline(move |err| {
			offline_calls.lock().unwrap().push(err.is_none());
		});
	}

	control.open(Duration::from_secs(5)).await.unwrap();
	let _first = new_connections.recv().await.unwrap();

	control.close().await.unwrap();
	control.close().await.unwrap();

	assert_eq!(offline_calls.lock().unwrap().as_slice(), [true]);
	assert!(!control.is_online());
}

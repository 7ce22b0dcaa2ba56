use crate::error::TransportError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// The opaque duplex transport contract the core depends on. Both the
/// control channel and rendezvous channels are opened through this trait;
/// the concrete transport (WS over TLS, in this crate) is an external
/// collaborator per the purpose & scope section, swappable for tests.
#[async_trait::async_trait]
pub trait Socket: Send {
	async fn write_text(&mut self, text: &str) -> Result<(), TransportError>;
	async fn write_binary(&mut self, data: &[u8]) -> Result<(), TransportError>;
	/// Reads the next text frame. `Ok(None)` means the peer closed cleanly.
	async fn read_text(&mut self) -> Result<Option<String>, TransportError>;
	async fn read_binary(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
	async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Connects to `url` within `timeout`, sending `headers` on the upgrade
/// request (e.g. `ServiceBusAuthorization`).
pub async fn connect(
	url: &url::Url,
	headers: &[(String, String)],
	timeout: Duration,
) -> Result<Box<dyn Socket>, TransportError> {
	let fut = connect_inner(url, headers);
	match tokio::time::timeout(timeout, fut).await {
		Ok(result) => result,
		Err(_elapsed) => Err(TransportError::Io(std::io::Error::new(
			std::io::ErrorKind::TimedOut,
			"socket connect timed out",
		))),
	}
}

async fn connect_inner(
	url: &url::Url,
	headers: &[(String, String)],
) -> Result<Box<dyn Socket>, TransportError> {
	let request = build_request(url, headers)?;
	let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
	Ok(Box::new(WebSocketSocket { stream }))
}

struct WebSocketSocket {
	stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait::async_trait]
impl Socket for WebSocketSocket {
	async fn write_text(&mut self, text: &str) -> Result<(), TransportError> {
		self.stream.send(WsMessage::Text(text.into())).await?;
		Ok(())
	}

	async fn write_binary(&mut self, data: &[u8]) -> Result<(), TransportError> {
		self.stream.send(WsMessage::Binary(data.to_vec().into())).await?;
		Ok(())
	}

	async fn read_text(&mut self) -> Result<Option<String>, TransportError> {
		loop {
			match self.stream.next().await {
				None => return Ok(None),
				Some(Ok(WsMessage::Text(text))) => return Ok(Some(text.to_string())),
				Some(Ok(WsMessage::Close(_))) => return Ok(None),
				Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
				Some(Ok(WsMessage::Binary(_))) => continue,
				Some(Ok(WsMessage::Frame(_))) => continue,
				Some(Err(e)) => return Err(e.into()),
			}
		}
	}

	async fn read_binary(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
		loop {
			match self.stream.next().await {
				None => return Ok(None),
				Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data.to_vec())),
				Some(Ok(WsMessage::Close(_))) => return Ok(None),
				Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
				Some(Ok(WsMessage::Text(_))) => continue,
				Some(Ok(WsMessage::Frame(_))) => continue,
				Some(Err(e)) => return Err(e.into()),
			}
		}
	}

	async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
		let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
			code: code.into(),
			reason: reason.to_string().into(),
		};
		match self.stream.close(Some(frame)).await {
			Ok(()) => Ok(()),
			Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read half of a split duplex transport: the control connection's read
/// pump is the sole owner of one of these, so it never contends with a
/// concurrent writer for the same lock.
#[async_trait::async_trait]
pub trait SocketReader: Send {
	async fn read_text(&mut self) -> Result<Option<String>, TransportError>;
}

/// Write half of a split duplex transport, held behind the control
/// connection's write lock so a command frame and its trailing body never
/// interleave with another writer.
#[async_trait::async_trait]
pub trait SocketWriter: Send {
	async fn write_text(&mut self, text: &str) -> Result<(), TransportError>;
	async fn write_binary(&mut self, data: &[u8]) -> Result<(), TransportError>;
	async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

struct WsReader {
	stream: SplitStream<WsStream>,
}

#[async_trait::async_trait]
impl SocketReader for WsReader {
	async fn read_text(&mut self) -> Result<Option<String>, TransportError> {
		loop {
			match self.stream.next().await {
				None => return Ok(None),
				Some(Ok(WsMessage::Text(text))) => return Ok(Some(text.to_string())),
				Some(Ok(WsMessage::Close(_))) => return Ok(None),
				Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
				Some(Ok(WsMessage::Binary(_))) => continue,
				Some(Ok(WsMessage::Frame(_))) => continue,
				Some(Err(e)) => return Err(e.into()),
			}
		}
	}
}

struct WsWriter {
	sink: SplitSink<WsStream, WsMessage>,
}

#[async_trait::async_trait]
impl SocketWriter for WsWriter {
	async fn write_text(&mut self, text: &str) -> Result<(), TransportError> {
		self.sink.send(WsMessage::Text(text.into())).await?;
		Ok(())
	}

	async fn write_binary(&mut self, data: &[u8]) -> Result<(), TransportError> {
		self.sink.send(WsMessage::Binary(data.to_vec().into())).await?;
		Ok(())
	}

	async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
		let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
			code: code.into(),
			reason: reason.to_string().into(),
		};
		match self.sink.send(WsMessage::Close(Some(frame))).await {
			Ok(()) => Ok(()),
			Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

/// Opens the control channel's transport. The production implementation
/// ([`WsConnector`]) dials a real websocket; tests substitute an in-memory
/// connector so the control connection's state machine can be exercised
/// without a network stack.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
	async fn connect(
		&self,
		url: &url::Url,
		headers: &[(String, String)],
		timeout: Duration,
	) -> Result<(Box<dyn SocketReader>, Box<dyn SocketWriter>), TransportError>;
}

pub struct WsConnector;

#[async_trait::async_trait]
impl Connector for WsConnector {
	async fn connect(
		&self,
		url: &url::Url,
		headers: &[(String, String)],
		timeout: Duration,
	) -> Result<(Box<dyn SocketReader>, Box<dyn SocketWriter>), TransportError> {
		connect_control(url, headers, timeout).await
	}
}

/// Connects the control channel and returns its halves separately, so the
/// read pump and a concurrent writer never fight over one `&mut`.
pub async fn connect_control(
	url: &url::Url,
	headers: &[(String, String)],
	timeout: Duration,
) -> Result<(Box<dyn SocketReader>, Box<dyn SocketWriter>), TransportError> {
	let fut = connect_control_inner(url, headers);
	match tokio::time::timeout(timeout, fut).await {
		Ok(result) => result,
		Err(_elapsed) => Err(TransportError::Io(std::io::Error::new(
			std::io::ErrorKind::TimedOut,
			"socket connect timed out",
		))),
	}
}

async fn connect_control_inner(
	url: &url::Url,
	headers: &[(String, String)],
) -> Result<(Box<dyn SocketReader>, Box<dyn SocketWriter>), TransportError> {
	let request = build_request(url, headers)?;
	let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
	let (sink, stream) = stream.split();
	Ok((
		Box::new(WsReader { stream }),
		Box::new(WsWriter { sink }),
	))
}

fn build_request(
	url: &url::Url,
	headers: &[(String, String)],
) -> Result<http::Request<()>, TransportError> {
	use tokio_tungstenite::tungstenite::client::IntoClientRequest;

	let mut request = url.as_str().into_client_request()?;
	for (key, value) in headers {
		request.headers_mut().insert(
			http::HeaderName::try_from(key.as_str())
				.map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?,
			http::HeaderValue::try_from(value.as_str())
				.map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?,
		);
	}
	request
		.headers_mut()
		.insert("Sec-WebSocket-Key", generate_key().parse().unwrap());
	Ok(request)
}

/// Distinguishes "the relay says this hybrid connection doesn't exist" (a
/// terminal 404/410 on the upgrade handshake) from an ordinary transient
/// transport failure that's worth retrying.
pub fn is_endpoint_not_found(err: &TransportError) -> bool {
	match err {
		TransportError::WebSocket(tokio_tungstenite::tungstenite::Error::Http(response)) => {
			matches!(response.status().as_u16(), 404 | 410)
		},
		_ => false,
	}
}

pub const NORMAL_CLOSURE: u16 = 1000;
pub const UNEXPECTED_CONDITION: u16 = 1011;

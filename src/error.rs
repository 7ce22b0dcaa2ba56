use std::io;

/// Error taxonomy for the listener, per the error-handling design: argument
/// errors are fatal and surfaced directly; transport errors are recovered by
/// reconnect unless the relay reports the endpoint gone; token errors only
/// ever defer renewal, never fail a send outright.
#[derive(thiserror::Error, Debug)]
pub enum ListenerError {
	#[error("invalid listener address: {0}")]
	InvalidAddress(String),

	#[error("listener is already open")]
	AlreadyOpen,

	#[error("listener is already closed")]
	AlreadyClosed,

	#[error("operation timed out after {0:?}")]
	Timeout(std::time::Duration),

	#[error("control connection is not online")]
	NotOnline,

	#[error("transport error: {0}")]
	Transport(#[from] TransportError),

	#[error("relay reports the hybrid connection endpoint does not exist")]
	EndpointNotFound,

	#[error("token error: {0}")]
	Token(#[from] TokenError),
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("websocket error: {0}")]
	WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
	#[error("url error: {0}")]
	Url(#[from] url::ParseError),
	#[error("connection closed")]
	Closed,
}

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
	#[error("token provider failed: {0}")]
	Provider(String),
	#[error("connection string is malformed: {0}")]
	ConnectionString(String),
}

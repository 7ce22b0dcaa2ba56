pub mod accept;
pub mod address;
pub mod config;
pub mod connection_string;
pub mod context;
pub mod control;
pub mod error;
pub mod http_bridge;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod sas;
pub mod strng;
pub mod token;
pub mod tracking;
pub mod transport;

pub use address::Address;
pub use context::{AcceptHandler, AcceptedChannel, ListenerContext, RequestHandler};
pub use error::{ListenerError, TokenError, TransportError};
pub use listener::Listener;

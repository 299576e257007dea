//! Transport adapters
//!
//! The connection handler is generic over `AsyncRead + AsyncWrite`; this
//! module supplies the pieces that turn raw TCP into the other listener
//! flavors: a TLS acceptor built from PEM files and a WebSocket stream
//! adapter for MQTT-over-WebSocket.

mod tls;
mod websocket;

pub use tls::{build_tls_acceptor, TlsError};
pub use websocket::WsStream;

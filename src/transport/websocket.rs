//! MQTT over WebSocket
//!
//! Wraps a server-side `tokio-tungstenite` stream as `AsyncRead` +
//! `AsyncWrite`. MQTT maps onto binary frames; frame boundaries carry no
//! meaning here, the MQTT decoder reframes from the byte stream. Text
//! frames are a protocol violation and close the connection.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

/// Byte-stream view of a WebSocket connection, generic over the inner
/// transport (plain TCP or TLS).
pub struct WsStream<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    stream: SplitStream<WebSocketStream<S>>,
    /// Bytes received but not yet read out
    read_buffer: BytesMut,
    closed: bool,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink,
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            closed: false,
        }
    }

    /// Run the server handshake, enforcing the request path and echoing a
    /// supported MQTT subprotocol when the client offers one.
    pub async fn accept(stream: S, expected_path: &str) -> io::Result<Self> {
        let expected_path = expected_path.to_string();
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, mut response: Response| {
                if req.uri().path() != expected_path {
                    return Err(ErrorResponse::new(Some(format!(
                        "unknown path '{}'",
                        req.uri().path()
                    ))));
                }
                let offered = req
                    .headers()
                    .get("sec-websocket-protocol")
                    .and_then(|v| v.to_str().ok());
                if let Some(offered) = offered {
                    for protocol in offered.split(',').map(str::trim) {
                        if matches!(protocol, "mqtt" | "mqttv3.1" | "mqttv5") {
                            if let Ok(value) = protocol.parse() {
                                response
                                    .headers_mut()
                                    .insert("sec-websocket-protocol", value);
                            }
                            break;
                        }
                    }
                }
                Ok(response)
            },
        )
        .await
        .map_err(io::Error::other)?;
        Ok(Self::new(ws))
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buffer.is_empty() {
                let n = buf.remaining().min(self.read_buffer.len());
                buf.put_slice(&self.read_buffer[..n]);
                self.read_buffer.advance(n);
                return Poll::Ready(Ok(()));
            }
            if self.closed {
                // EOF
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.read_buffer.extend_from_slice(&data);
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    self.closed = true;
                }
                Poll::Ready(Some(Ok(Message::Text(_)))) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "text frame on MQTT WebSocket",
                    )));
                }
                Poll::Ready(Some(Ok(_))) => {
                    // Ping/pong handled by tungstenite; spin once more.
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io::Error::other(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let message = Message::Binary(buf.to_vec().into());
                match Pin::new(&mut self.sink).start_send(message) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(io::Error::other(e))),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.sink)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let _ = Pin::new(&mut self.sink).start_send(Message::Close(None));
                Pin::new(&mut self.sink)
                    .poll_flush(cx)
                    .map_err(io::Error::other)
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

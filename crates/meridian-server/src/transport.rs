//! Text-frame transport seam.
//!
//! Dispatchers talk to any `Stream` of inbound text frames and `Sink` of
//! outbound text. [`split_socket`] adapts an axum [`WebSocket`]; tests use
//! in-memory channels.

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt, future};

/// Error raised by a connection transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// The socket failed.
    #[error("socket error: {0}")]
    Socket(String),
}

/// Split a WebSocket into an inbound text stream and an outbound text sink.
///
/// Close frames surface as `Err(TransportError::Closed)`; ping/pong frames
/// are handled by axum and skipped here. Binary frames are accepted if they
/// hold UTF-8.
pub fn split_socket(
    socket: WebSocket,
) -> (
    impl Stream<Item = Result<String, TransportError>> + Send + Unpin,
    impl Sink<String, Error = TransportError> + Send + Unpin,
) {
    let (sender, receiver) = socket.split();

    let sink = sender
        .sink_map_err(|e| TransportError::Socket(e.to_string()))
        .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

    let stream = receiver.filter_map(|frame| {
        future::ready(match frame {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(Message::Binary(bytes)) => {
                Some(String::from_utf8(bytes.to_vec()).map_err(|e| TransportError::Socket(e.to_string())))
            }
            Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
            Ok(Message::Ping(_) | Message::Pong(_)) => None,
            Err(e) => Some(Err(TransportError::Socket(e.to_string()))),
        })
    });

    (stream, sink)
}

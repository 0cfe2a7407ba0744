//! Frame transports a [`Session`](crate::Session) runs over.
//!
//! A transport is a pair of a sink and a stream of binary frames. The server
//! adapts a WebSocket upgraded by axum, the client a tungstenite WebSocket.

use std::{fmt, pin::Pin};

use futures::{channel::mpsc, Sink, SinkExt, Stream, StreamExt};

/// Outgoing half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = TransportError> + Send>>;

/// Incoming half of a transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// Error of the underlying transport.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(String);

impl TransportError {
    /// Creates a new transport error.
    pub fn new(err: impl fmt::Display) -> Self {
        Self(err.to_string())
    }
}

/// Creates a connected pair of in-memory transports.
pub fn memory() -> ((FrameSink, FrameStream), (FrameSink, FrameStream)) {
    let (a_tx, a_rx) = mpsc::unbounded::<Vec<u8>>();
    let (b_tx, b_rx) = mpsc::unbounded::<Vec<u8>>();

    let a: (FrameSink, FrameStream) = (
        Box::pin(a_tx.sink_map_err(TransportError::new)),
        Box::pin(b_rx.map(Ok)),
    );
    let b: (FrameSink, FrameStream) = (
        Box::pin(b_tx.sink_map_err(TransportError::new)),
        Box::pin(a_rx.map(Ok)),
    );

    (a, b)
}

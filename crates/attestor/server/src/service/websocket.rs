use attestor_common::{FrameSink, FrameStream, Session, TransportError};
use attestor_core::RpcMessage;
use axum::extract::ws::{Message, WebSocket};
use futures::{future, SinkExt, StreamExt};
use tracing::{debug, info};

use crate::{session::handle_session, types::AttestorGlobals};

/// Runs a client session over the established websocket connection
pub async fn websocket_session(
    socket: WebSocket,
    attestor_globals: AttestorGlobals,
    initial: Vec<RpcMessage>,
) {
    debug!("Upgraded to websocket connection");

    let (sink, stream) = into_transport(socket);
    let session = Session::new(sink, stream, attestor_globals.session_config.clone());
    let session_id = session.id().to_string();

    handle_session(session, attestor_globals, initial).await;

    info!(?session_id, "Websocket session finished");
}

/// Adapts the websocket into a binary frame transport. Frames other than
/// binary ones carry no session data and are skipped.
fn into_transport(socket: WebSocket) -> (FrameSink, FrameStream) {
    let (sink, stream) = socket.split();

    let sink = sink
        .with(|frame: Vec<u8>| future::ready(Ok::<_, axum::Error>(Message::Binary(frame.into()))))
        .sink_map_err(TransportError::new);

    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Binary(frame)) => Some(Ok(frame.to_vec())),
            Ok(_) => None,
            Err(err) => Some(Err(TransportError::new(err))),
        })
    });

    (Box::pin(sink), Box::pin(stream))
}

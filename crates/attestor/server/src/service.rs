pub mod websocket;

use attestor_core::{codec::decode_batch, RpcMessage};
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use tracing::{debug, error, info};

use crate::{
    error::AttestorServerError,
    service::websocket::websocket_session,
    types::{AttestorGlobals, WebSocketQuery},
};

/// Handler to upgrade the connection to a websocket carrying a client
/// session. The `messages` query parameter may carry the first batch of the
/// session, usually the init request.
pub async fn upgrade_websocket(
    ws: WebSocketUpgrade,
    State(attestor_globals): State<AttestorGlobals>,
    Query(params): Query<WebSocketQuery>,
) -> Response {
    info!("Received websocket upgrade request");

    let initial = match params.messages.as_deref().map(decode_initial_messages) {
        Some(Ok(messages)) => messages,
        Some(Err(err)) => {
            error!("Malformed initial messages: {err}");
            return err.into_response();
        }
        None => Vec::new(),
    };
    debug!(count = initial.len(), "decoded initial messages");

    // Each session holds a permit until it ends
    let permit = match attestor_globals.semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            error!("Rejecting client session, the attestor is at capacity");
            return AttestorServerError::Overloaded.into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        websocket_session(socket, attestor_globals, initial).await;
        drop(permit);
    })
}

/// Decodes the batch carried in the `messages` query parameter.
pub fn decode_initial_messages(encoded: &str) -> Result<Vec<RpcMessage>, AttestorServerError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|err| AttestorServerError::BadClientRequest(format!("invalid base64: {err}")))?;

    decode_batch(&bytes)
        .map_err(|err| AttestorServerError::BadClientRequest(format!("invalid messages: {err}")))
}

#[cfg(test)]
mod test {
    use super::*;
    use attestor_core::{
        codec::encode_batch,
        msg::{InitRequest, RpcRequest},
        signing::SignatureType,
        Payload,
    };

    #[test]
    fn test_decode_initial_messages() {
        let messages = vec![RpcMessage {
            id: 1,
            payload: Payload::Request(RpcRequest::Init(InitRequest {
                client_version: attestor_core::PROTOCOL_VERSION,
                signature_type: SignatureType::Secp256k1Eth,
                auth: None,
            })),
        }];
        let encoded = URL_SAFE_NO_PAD.encode(encode_batch(&messages).unwrap());

        assert_eq!(decode_initial_messages(&encoded).unwrap(), messages);
    }

    #[test]
    fn test_decode_invalid_messages() {
        assert!(matches!(
            decode_initial_messages("not base64!"),
            Err(AttestorServerError::BadClientRequest(_))
        ));
        assert!(matches!(
            decode_initial_messages(&URL_SAFE_NO_PAD.encode(b"\x01")),
            Err(AttestorServerError::BadClientRequest(_))
        ));
    }
}

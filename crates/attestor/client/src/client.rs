//! Attestor client.
//!
//! This module connects to an attestor over a websocket, folding the `init`
//! request into the connection URL so no extra round trip is needed.

use std::time::Duration;

use async_tungstenite::{
    tokio::connect_async,
    tungstenite::{Error as WsError, Message},
};
use attestor_common::{
    session::DEFAULT_REQUEST_TIMEOUT, Event, EventKind, FrameSink, FrameStream, Session,
    SessionConfig, SessionMetadata, TransportError,
};
use attestor_core::{
    auth::AuthenticationRequest,
    codec::encode_batch,
    msg::{InitRequest, RpcRequest, RpcResponse},
    signing::SignatureType,
    Payload, RpcError, RpcMessage, PROTOCOL_VERSION,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use futures::{future, SinkExt, StreamExt};
use tracing::{debug, info};

use crate::error::{ClientError, ErrorKind};

/// Configuration of an [`AttestorClient`].
#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(build_fn(error = "ClientError"))]
pub struct AttestorClientConfig {
    /// Websocket URL of the attestor, e.g. `ws://localhost:8001/ws`.
    #[builder(setter(into))]
    url: String,
    /// Scheme claims are signed with.
    #[builder(default)]
    signature_type: SignatureType,
    /// Authentication token, if the attestor requires one.
    #[builder(setter(strip_option), default)]
    auth: Option<AuthenticationRequest>,
    /// Time to wait for responses, including the response to `init`.
    #[builder(default = "DEFAULT_REQUEST_TIMEOUT")]
    request_timeout: Duration,
}

impl AttestorClientConfig {
    /// Creates a new builder for `AttestorClientConfig`.
    pub fn builder() -> AttestorClientConfigBuilder {
        AttestorClientConfigBuilder::default()
    }

    /// Returns the attestor URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn init_request(&self) -> InitRequest {
        InitRequest {
            client_version: PROTOCOL_VERSION,
            signature_type: self.signature_type,
            auth: self.auth.clone(),
        }
    }
}

/// An initialised session with an attestor.
#[derive(Debug, Clone)]
pub struct AttestorClient {
    url: String,
    session: Session,
}

impl AttestorClient {
    /// Connects to the attestor and initialises the session.
    pub async fn connect(config: &AttestorClientConfig) -> Result<Self, ClientError> {
        let session_config = SessionConfig {
            request_timeout: config.request_timeout,
        };
        let init_id = 1;
        let init = RpcMessage {
            id: init_id,
            payload: Payload::Request(RpcRequest::Init(config.init_request())),
        };
        let encoded = encode_batch(&[init])
            .map_err(|err| ClientError::new(ErrorKind::Internal, Some(Box::new(err))))?;
        let url = with_messages(&config.url, &URL_SAFE_NO_PAD.encode(encoded));

        debug!(url = %config.url, "connecting to attestor");
        let (ws, _) = connect_async(url)
            .await
            .map_err(|err| ClientError::new(ErrorKind::Connection, Some(Box::new(err))))?;
        let (sink, stream) = into_transport(ws);

        let session = Session::new(sink, stream, session_config);
        // Ids are shared with the init message sent in the URL.
        let _ = session.next_message_id();

        Self::initialize(config, session, init_id).await
    }

    /// Wraps a session whose init request with id `init_id` was already sent,
    /// waiting for the attestor to answer it.
    pub async fn initialize(
        config: &AttestorClientConfig,
        session: Session,
        init_id: u32,
    ) -> Result<Self, ClientError> {
        let (response_sub, mut responses) = session.events().subscribe(EventKind::Response);
        let (terminated_sub, mut terminated) =
            session.events().subscribe(EventKind::ConnectionTerminated);
        session.start();

        let wait = async {
            loop {
                tokio::select! {
                    Some(event) = responses.recv() => {
                        if let Event::Response { id, result } = event {
                            if id == init_id {
                                return result;
                            }
                        }
                    }
                    Some(Event::ConnectionTerminated(cause)) = terminated.recv() => {
                        return Err(RpcError::network(format!("session terminated during init: {cause}")));
                    }
                    else => return Err(RpcError::network("session closed during init")),
                }
            }
        };
        let result = tokio::time::timeout(config.request_timeout, wait).await;
        session.off(response_sub);
        session.off(terminated_sub);

        let response = match result {
            Ok(result) => result?,
            Err(_) => {
                session.end(Some(RpcError::network("init timed out")));
                return Err(ClientError::msg(
                    ErrorKind::Connection,
                    "timed out waiting for init response",
                ));
            }
        };
        if !matches!(response, RpcResponse::Init(_)) {
            return Err(ClientError::msg(
                ErrorKind::Rpc,
                format!("expected init response, got {}", response.rpc_type()),
            ));
        }

        let init = config.init_request();
        session.set_initialized(SessionMetadata {
            client_version: init.client_version,
            signature_type: init.signature_type,
            auth: init.auth.map(|auth| auth.data),
        });
        info!(url = %config.url, session_id = %session.id(), "connected to attestor");

        Ok(Self {
            url: config.url.clone(),
            session,
        })
    }

    /// Returns the attestor URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the underlying session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Returns `true` until the session terminates.
    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    /// Sends a request and waits for its response.
    pub async fn request(&self, request: RpcRequest) -> Result<RpcResponse, ClientError> {
        Ok(self.session.request(request).await?)
    }

    /// Ends the session gracefully.
    pub fn close(&self) {
        self.session.end(None);
    }
}

/// Appends the encoded initial batch to `url`.
fn with_messages(url: &str, encoded: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}messages={encoded}")
}

/// Adapts a websocket into a binary frame transport.
fn into_transport<S>(ws: async_tungstenite::WebSocketStream<S>) -> (FrameSink, FrameStream)
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let sink = sink
        .with(|frame: Vec<u8>| future::ready(Ok::<_, WsError>(Message::Binary(frame))))
        .sink_map_err(TransportError::new);

    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Binary(frame)) => Some(Ok(frame)),
            Ok(_) => None,
            Err(err) => Some(Err(TransportError::new(err))),
        })
    });

    (Box::pin(sink), Box::pin(stream))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_with_messages() {
        assert_eq!(with_messages("ws://a/ws", "AQ"), "ws://a/ws?messages=AQ");
        assert_eq!(with_messages("ws://a/ws?x=1", "AQ"), "ws://a/ws?x=1&messages=AQ");
    }

    #[test]
    fn test_config_requires_url() {
        let err = AttestorClientConfig::builder().build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Builder);
        assert!(err.to_string().contains("url"));
    }
}

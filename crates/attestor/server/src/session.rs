//! Handling of one client session: initialisation, tunnels and claims.
//!
//! Requests, tunnel messages and connection results are processed in order by
//! a single task which owns the tunnel map. Claim verification runs in its own
//! task so a slow claim does not hold up tunnels.

use std::{collections::HashMap, future::Future, panic::AssertUnwindSafe, sync::Arc};

use attestor_common::{Event, EventKind, IncomingRequest, Session, SessionMetadata};
use attestor_core::{
    geo::validate_geo_location,
    msg::{
        ClaimTunnelRequest, CreateTunnelRequest, CreateTunnelResponse, DisconnectTunnelRequest,
        DisconnectTunnelResponse, InitRequest, InitResponse, TunnelDisconnectEvent, TunnelMessage,
    },
    unix_time, ErrorCode, Payload, RpcError, RpcMessage, RpcRequest, RpcResponse,
};
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    auth::authenticate,
    tunnel::{TcpTunnel, TunnelError, TunnelHandlers},
    types::AttestorGlobals,
};

enum Input {
    Event(Event),
    Connected {
        request: IncomingRequest,
        tunnel_id: u32,
        result: Result<Arc<TcpTunnel>, TunnelError>,
    },
}

enum TunnelSlot {
    /// Connecting, with the writes which arrived meanwhile.
    Pending(Vec<Vec<u8>>),
    Open(Arc<TcpTunnel>),
}

struct SessionHandler {
    session: Session,
    globals: AttestorGlobals,
    tunnels: HashMap<u32, TunnelSlot>,
    tx: mpsc::UnboundedSender<Input>,
}

/// Serves a client session until it terminates.
///
/// `initial` holds messages which arrived with the connection request.
#[instrument(skip_all, fields(session_id = %session.id()))]
pub async fn handle_session(session: Session, globals: AttestorGlobals, initial: Vec<RpcMessage>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscriptions: Vec<_> = [
        EventKind::Request,
        EventKind::TunnelMessage,
        EventKind::ConnectionTerminated,
    ]
    .into_iter()
    .map(|kind| {
        let tx = tx.clone();
        session.on(kind, move |event| {
            let _ = tx.send(Input::Event(event.clone()));
        })
    })
    .collect();

    let mut handler = SessionHandler {
        session: session.clone(),
        globals,
        tunnels: HashMap::new(),
        tx,
    };

    info!("client session started");
    session.start_with(initial);

    while let Some(input) = rx.recv().await {
        match input {
            Input::Event(Event::Request(request)) => handler.handle_request(request),
            Input::Event(Event::TunnelMessage(msg)) => handler.handle_tunnel_message(msg),
            Input::Event(Event::ConnectionTerminated(cause)) => {
                debug!(%cause, "closing tunnels of terminated session");
                handler.close_all();
                break;
            }
            Input::Event(_) => {}
            Input::Connected {
                request,
                tunnel_id,
                result,
            } => handler.handle_connected(request, tunnel_id, result),
        }
    }

    for id in subscriptions {
        session.off(id);
    }
    info!("client session ended");
}

impl SessionHandler {
    fn handle_request(&mut self, request: IncomingRequest) {
        trace!(id = request.id(), rpc_type = %request.rpc_type(), "handling request");

        let result = match request.request().clone() {
            RpcRequest::Init(init) => self.init(init),
            RpcRequest::CreateTunnel(create) => {
                // Answered once the connection attempt finishes.
                if let Err(err) = self.create_tunnel(&request, create) {
                    respond(&request, Err(err));
                }
                return;
            }
            RpcRequest::DisconnectTunnel(disconnect) => self.disconnect_tunnel(disconnect),
            RpcRequest::ClaimTunnel(claim) => {
                if let Err(err) = self.claim_tunnel(&request, claim) {
                    respond(&request, Err(err));
                }
                return;
            }
            RpcRequest::ClaimTeeBundle(claim) => {
                let verifier = self.globals.claim_verifier.clone();
                let tee_verifier = self.globals.tee_verifier.clone();
                spawn_response(request, async move {
                    verifier
                        .verify_tee_claim(tee_verifier.as_deref(), claim, unix_time())
                        .await
                        .map(|response| RpcResponse::ClaimTeeBundle(Box::new(response)))
                });
                return;
            }
            RpcRequest::CreateClaimOnChain(_) | RpcRequest::CompleteClaimOnChain(_) => Err(
                RpcError::not_supported(format!("{} is not supported", request.rpc_type())),
            ),
        };

        respond(&request, result);
    }

    fn init(&mut self, init: InitRequest) -> Result<RpcResponse, RpcError> {
        let auth = authenticate(&self.globals.auth_config, init.auth.as_ref(), unix_time())?;

        self.session.set_initialized(SessionMetadata {
            client_version: init.client_version,
            signature_type: init.signature_type,
            auth,
        });

        Ok(RpcResponse::Init(InitResponse {}))
    }

    fn create_tunnel(
        &mut self,
        request: &IncomingRequest,
        create: CreateTunnelRequest,
    ) -> Result<(), RpcError> {
        let id = create.id;
        if self.tunnels.contains_key(&id) {
            return Err(RpcError::bad_request(format!("Tunnel {id} already exists")));
        }

        if let Some(geo_location) = &create.geo_location {
            validate_geo_location(geo_location)
                .map_err(|err| RpcError::bad_request(err.to_string()))?;
        }

        if let Some(user) = self.session.metadata().and_then(|metadata| metadata.auth) {
            if !user.allows_host(&create.host) {
                return Err(RpcError::bad_request(format!(
                    "Host {} is not allowed for user {}",
                    create.host, user.id
                )));
            }
        }

        if create.geo_location.is_some() && self.globals.connect_options.proxy.is_none() {
            return Err(RpcError::new(
                ErrorCode::ProxyError,
                "Geolocation is not supported by this attestor",
            ));
        }

        debug!(tunnel_id = id, host = %create.host, port = create.port, "creating tunnel");
        self.tunnels.insert(id, TunnelSlot::Pending(Vec::new()));

        let session = self.session.clone();
        let on_close_session = self.session.clone();
        let handlers = TunnelHandlers {
            on_message: Box::new(move |message| {
                let payload = Payload::TunnelMessage(TunnelMessage {
                    tunnel_id: id,
                    message,
                });
                if let Err(err) = session.send_payloads(vec![payload]) {
                    debug!(tunnel_id = id, %err, "dropped tunnel message");
                }
            }),
            on_close: Box::new(move |error| {
                if !on_close_session.is_open() {
                    return;
                }
                let payload = Payload::TunnelDisconnectEvent(TunnelDisconnectEvent {
                    tunnel_id: id,
                    error,
                });
                let _ = on_close_session.send_payloads(vec![payload]);
            }),
        };

        let options = self.globals.connect_options.clone();
        let tx = self.tx.clone();
        let request = request.clone();
        tokio::spawn(async move {
            let result = TcpTunnel::connect(create, &options, handlers).await;
            // The session is gone if the send fails.
            if let Err(mpsc::error::SendError(Input::Connected {
                result: Ok(tunnel), ..
            })) = tx.send(Input::Connected {
                request,
                tunnel_id: id,
                result,
            }) {
                tunnel.shutdown();
            }
        });

        Ok(())
    }

    fn handle_connected(
        &mut self,
        request: IncomingRequest,
        tunnel_id: u32,
        result: Result<Arc<TcpTunnel>, TunnelError>,
    ) {
        let tunnel = match result {
            Ok(tunnel) => tunnel,
            Err(err) => {
                warn!(tunnel_id, %err, "failed to create tunnel");
                if matches!(self.tunnels.get(&tunnel_id), Some(TunnelSlot::Pending(_))) {
                    self.tunnels.remove(&tunnel_id);
                }
                respond(&request, Err(err.into()));
                return;
            }
        };

        let buffered = match self.tunnels.remove(&tunnel_id) {
            Some(TunnelSlot::Pending(buffered)) => buffered,
            other => {
                // Disconnected while connecting.
                if let Some(other) = other {
                    self.tunnels.insert(tunnel_id, other);
                }
                tunnel.shutdown();
                respond(
                    &request,
                    Err(RpcError::network(format!(
                        "Tunnel {tunnel_id} was closed while connecting"
                    ))),
                );
                return;
            }
        };

        for data in buffered {
            if let Err(err) = tunnel.write(data) {
                warn!(tunnel_id, %err, "failed to flush buffered write");
            }
        }
        self.tunnels.insert(tunnel_id, TunnelSlot::Open(tunnel));

        info!(tunnel_id, "tunnel created");
        respond(&request, Ok(RpcResponse::CreateTunnel(CreateTunnelResponse {})));
    }

    fn handle_tunnel_message(&mut self, msg: TunnelMessage) {
        match self.tunnels.get_mut(&msg.tunnel_id) {
            Some(TunnelSlot::Pending(buffered)) => buffered.push(msg.message),
            Some(TunnelSlot::Open(tunnel)) => {
                if let Err(err) = tunnel.write(msg.message) {
                    debug!(tunnel_id = msg.tunnel_id, %err, "dropped write to tunnel");
                }
            }
            None => debug!(tunnel_id = msg.tunnel_id, "message for unknown tunnel"),
        }
    }

    fn disconnect_tunnel(
        &mut self,
        disconnect: DisconnectTunnelRequest,
    ) -> Result<RpcResponse, RpcError> {
        let slot = self.tunnels.remove(&disconnect.id).ok_or_else(|| {
            RpcError::not_found(format!("Tunnel {} not found", disconnect.id))
        })?;

        if let TunnelSlot::Open(tunnel) = slot {
            tunnel.shutdown();
        }
        debug!(tunnel_id = disconnect.id, "tunnel disconnected by client");

        Ok(RpcResponse::DisconnectTunnel(DisconnectTunnelResponse {}))
    }

    fn claim_tunnel(
        &mut self,
        request: &IncomingRequest,
        claim: ClaimTunnelRequest,
    ) -> Result<(), RpcError> {
        let id = claim.request.id;
        let tunnel = match self.tunnels.remove(&id) {
            Some(TunnelSlot::Open(tunnel)) => tunnel,
            Some(pending @ TunnelSlot::Pending(_)) => {
                self.tunnels.insert(id, pending);
                return Err(RpcError::bad_request(format!("Tunnel {id} is still connecting")));
            }
            None => return Err(RpcError::not_found(format!("Tunnel {id} not found"))),
        };
        tunnel.shutdown();

        let verifier = self.globals.claim_verifier.clone();
        spawn_response(request.clone(), async move {
            verifier
                .verify_tunnel_claim(tunnel.request(), &tunnel.transcript(), claim, unix_time())
                .await
                .map(|response| RpcResponse::ClaimTunnel(Box::new(response)))
        });

        Ok(())
    }

    fn close_all(&mut self) {
        for (_, slot) in self.tunnels.drain() {
            if let TunnelSlot::Open(tunnel) = slot {
                tunnel.shutdown();
            }
        }
    }
}

/// Answers `request` with the output of `handler`, run in its own task. A
/// panic in the handler is answered with an internal error.
fn spawn_response<F>(request: IncomingRequest, handler: F)
where
    F: Future<Output = Result<RpcResponse, RpcError>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = AssertUnwindSafe(handler)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(id = request.id(), rpc_type = %request.rpc_type(), "request handler panicked");
                Err(RpcError::internal(format!(
                    "{} failed unexpectedly",
                    request.rpc_type()
                )))
            });
        respond(&request, result);
    });
}

fn respond(request: &IncomingRequest, result: Result<RpcResponse, RpcError>) {
    if let Err(err) = request.respond(result) {
        debug!(id = request.id(), %err, "could not respond to request");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use attestor_common::{transport::memory, SessionConfig};
    use attestor_core::{
        claim::{ClaimRequestData, ClaimRequestSignatures, ClaimTranscriptMessage},
        msg::{ChainRequest, ClaimTeeBundleRequest, TeeBundle},
        signing::{KeyPair, SignatureType},
        PROTOCOL_VERSION,
    };
    use tls_core::ServerCertVerifier;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::Semaphore,
    };

    use crate::{
        claim::{ClaimVerifier, TeeBundleVerifier},
        config::AuthProperties,
        providers::ProviderRegistry,
        tunnel::ConnectOptions,
    };

    fn globals() -> AttestorGlobals {
        let key = Arc::new(KeyPair::random(SignatureType::Secp256k1Eth));
        AttestorGlobals::new(
            key.clone(),
            ClaimVerifier::new(
                key,
                Arc::new(ServerCertVerifier::mozilla()),
                Arc::new(ProviderRegistry::new()),
                600,
            ),
            AuthProperties::default(),
            ConnectOptions {
                connect_timeout: Duration::from_secs(1),
                proxy: None,
            },
            Duration::from_secs(5),
            Arc::new(Semaphore::new(1)),
        )
    }

    /// Starts a server session and returns an initialised client session.
    async fn connect() -> Session {
        connect_with(globals()).await
    }

    async fn connect_with(globals: AttestorGlobals) -> Session {
        let ((client_sink, client_stream), (server_sink, server_stream)) = memory();
        let server = Session::new(server_sink, server_stream, SessionConfig::default());
        tokio::spawn(handle_session(server, globals, Vec::new()));

        let client = Session::new(client_sink, client_stream, SessionConfig::default());
        client.start();
        client
            .request(init_request())
            .await
            .expect("init should succeed");
        client
    }

    fn init_request() -> RpcRequest {
        RpcRequest::Init(InitRequest {
            client_version: PROTOCOL_VERSION,
            signature_type: SignatureType::Secp256k1Eth,
            auth: None,
        })
    }

    fn create(id: u32, port: u16, geo_location: Option<&str>) -> RpcRequest {
        RpcRequest::CreateTunnel(CreateTunnelRequest {
            id,
            host: "127.0.0.1".to_string(),
            port,
            geo_location: geo_location.map(str::to_string),
        })
    }

    async fn spawn_echo() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                stream
                    .write_all(&buf[..n].to_ascii_uppercase())
                    .await
                    .unwrap();
            }
        });
        port
    }

    #[tokio::test]
    async fn test_second_init_rejected() {
        let client = connect().await;

        let err = client.request(init_request()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
        assert_eq!(err.message, "Client already initialised");
    }

    #[tokio::test]
    async fn test_tunnel_relays_piggybacked_message() {
        let client = connect().await;
        let port = spawn_echo().await;
        let (_, mut messages) = client.events().subscribe(EventKind::TunnelMessage);

        // The first write travels in the same frame as the create request.
        let trailing = vec![Payload::TunnelMessage(TunnelMessage {
            tunnel_id: 7,
            message: b"hello".to_vec(),
        })];
        client
            .request_with(create(7, port, None), trailing, Duration::from_secs(5))
            .await
            .unwrap();

        let Some(Event::TunnelMessage(msg)) = messages.recv().await else {
            panic!("expected tunnel message");
        };
        assert_eq!(msg.tunnel_id, 7);
        assert_eq!(msg.message, b"HELLO");

        let err = client.request(create(7, port, None)).await.unwrap_err();
        assert_eq!(err.message, "Tunnel 7 already exists");
    }

    #[tokio::test]
    async fn test_invalid_geolocation() {
        let client = connect().await;

        let err = client.request(create(1, 443, Some("XZ"))).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
        assert_eq!(err.message, r#"Geolocation "XZ" is invalid"#);
    }

    #[tokio::test]
    async fn test_geolocation_without_proxy() {
        let client = connect().await;

        let err = client.request(create(1, 443, Some("US"))).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ProxyError);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_tunnel() {
        let client = connect().await;

        let err = client
            .request(RpcRequest::DisconnectTunnel(DisconnectTunnelRequest { id: 3 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_disconnect_twice() {
        let client = connect().await;
        let port = spawn_echo().await;
        client.request(create(2, port, None)).await.unwrap();

        let disconnect = RpcRequest::DisconnectTunnel(DisconnectTunnelRequest { id: 2 });
        client.request(disconnect.clone()).await.unwrap();
        let err = client.request(disconnect).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_chain_rpc_not_supported() {
        let client = connect().await;

        let err = client
            .request(RpcRequest::CreateClaimOnChain(ChainRequest {
                payload: "{}".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotSupported);
    }

    struct PanickingVerifier;

    #[async_trait::async_trait]
    impl TeeBundleVerifier for PanickingVerifier {
        async fn verify(
            &self,
            _bundle: &TeeBundle,
        ) -> Result<Vec<ClaimTranscriptMessage>, RpcError> {
            panic!("bundle verifier failed")
        }
    }

    #[tokio::test]
    async fn test_panicking_claim_is_answered() {
        let client =
            connect_with(globals().with_tee_verifier(Arc::new(PanickingVerifier))).await;

        let request = RpcRequest::ClaimTeeBundle(ClaimTeeBundleRequest {
            bundle: TeeBundle {
                request: CreateTunnelRequest {
                    id: 1,
                    host: "example.com".to_string(),
                    port: 443,
                    geo_location: None,
                },
                transcript: Vec::new(),
                attestations: Vec::new(),
            },
            data: ClaimRequestData::default(),
            signatures: ClaimRequestSignatures::default(),
        });
        let err = client
            .request_with(request, Vec::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);

        // The session survives.
        let err = client.request(init_request()).await.unwrap_err();
        assert_eq!(err.message, "Client already initialised");
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let client = connect().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = client.request(create(1, port, None)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkError);

        // Nothing was registered, so the id can be reused.
        let port = spawn_echo().await;
        client.request(create(1, port, None)).await.unwrap();
    }
}

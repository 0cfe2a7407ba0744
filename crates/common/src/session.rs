//! RPC session over a frame transport.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use attestor_core::{
    auth::AuthenticatedUserData,
    codec::{decode_batch, encode_batch},
    signing::SignatureType,
    ErrorCode, Payload, RpcError, RpcMessage, RpcRequest, RpcResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    event::{Event, EventKind, EventRegistry, SubscriptionId},
    transport::{FrameSink, FrameStream},
};

/// Default time to wait for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time to wait for a response before a request fails with
    /// [`ErrorCode::Timeout`].
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// What was negotiated during initialisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    /// Protocol version of the client.
    pub client_version: u32,
    /// Scheme claims are signed with.
    pub signature_type: SignatureType,
    /// The authenticated user, if any.
    pub auth: Option<AuthenticatedUserData>,
}

type Waiter = oneshot::Sender<Result<RpcResponse, RpcError>>;

enum Outbound {
    Batch(Vec<RpcMessage>),
    Close,
}

#[derive(Default)]
struct State {
    metadata: Option<SessionMetadata>,
    /// Released once the in-flight init request is answered.
    init_gate: Option<oneshot::Sender<()>>,
    terminated: Option<RpcError>,
    stream: Option<FrameStream>,
}

struct Inner {
    id: String,
    config: SessionConfig,
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, Waiter>>,
    state: Mutex<State>,
    events: EventRegistry,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
}

/// An RPC session.
///
/// Cheap to clone, all clones refer to the same session. The session is
/// closed when the transport closes, when either side ends it, or when the
/// last handle is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

opaque_debug::implement!(Session);

impl Session {
    /// Creates a session over a transport.
    ///
    /// Outgoing messages are written right away. Nothing is read until
    /// [`start`](Self::start) is called, so handlers can be registered first.
    pub fn new(sink: FrameSink, stream: FrameStream, config: SessionConfig) -> Self {
        let (outbound, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            state: Mutex::new(State {
                stream: Some(stream),
                ..Default::default()
            }),
            events: EventRegistry::new(),
            outbound,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(write_loop(Arc::downgrade(&inner), sink, rx));

        Self { inner }
    }

    /// Starts reading from the transport.
    pub fn start(&self) {
        self.start_with(Vec::new());
    }

    /// Starts reading from the transport, processing `initial` first.
    ///
    /// Used for messages which arrived out of band, like the batch carried
    /// in the connection URL. Calling this more than once has no effect.
    pub fn start_with(&self, initial: Vec<RpcMessage>) {
        let Some(stream) = self.inner.lock_state().stream.take() else {
            return;
        };

        tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            self.inner.cancel.clone(),
            stream,
            initial,
        ));
    }

    /// Returns the session id, used for logging.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Returns the configuration of the session.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Returns the event registry of the session.
    pub fn events(&self) -> &EventRegistry {
        &self.inner.events
    }

    /// Registers `handler` for events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    /// Removes a handler.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.events.off(id)
    }

    /// Returns `true` until the session terminates.
    pub fn is_open(&self) -> bool {
        self.inner.lock_state().terminated.is_none()
    }

    /// Returns why the session terminated, if it has.
    pub fn termination(&self) -> Option<RpcError> {
        self.inner.lock_state().terminated.clone()
    }

    /// Waits until the session terminates and returns why.
    pub async fn terminated(&self) -> RpcError {
        self.inner.cancel.cancelled().await;
        self.termination().unwrap_or_else(RpcError::no_error)
    }

    /// Returns `true` once initialisation completed.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock_state().metadata.is_some()
    }

    /// Returns the metadata recorded at initialisation.
    pub fn metadata(&self) -> Option<SessionMetadata> {
        self.inner.lock_state().metadata.clone()
    }

    /// Marks the session initialised.
    ///
    /// The server calls this before answering a successful init request, the
    /// client after receiving the answer.
    pub fn set_initialized(&self, metadata: SessionMetadata) {
        debug!(session_id = %self.inner.id, ?metadata, "session initialised");
        self.inner.lock_state().metadata = Some(metadata);
    }

    /// Returns a fresh message id.
    pub fn next_message_id(&self) -> u32 {
        self.inner.next_message_id()
    }

    /// Sends a batch of messages in one frame.
    pub fn send(&self, messages: Vec<RpcMessage>) -> Result<(), RpcError> {
        self.inner.send(messages)
    }

    /// Sends payloads which do not expect a response, each with a fresh id.
    pub fn send_payloads(&self, payloads: Vec<Payload>) -> Result<(), RpcError> {
        let messages = payloads
            .into_iter()
            .map(|payload| RpcMessage {
                id: self.inner.next_message_id(),
                payload,
            })
            .collect();
        self.inner.send(messages)
    }

    /// Sends a request and waits for its response using the configured
    /// timeout.
    pub async fn request(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        self.request_with(request, Vec::new(), self.inner.config.request_timeout)
            .await
    }

    /// Sends a request and waits for its response for at most `timeout`.
    pub async fn request_with_timeout(
        &self,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, RpcError> {
        self.request_with(request, Vec::new(), timeout).await
    }

    /// Sends a request followed by `trailing` payloads in the same frame and
    /// waits for the response to the request.
    ///
    /// Resolves with whichever comes first: the response, termination of the
    /// session, or the timeout.
    pub async fn request_with(
        &self,
        request: RpcRequest,
        trailing: Vec<Payload>,
        timeout: Duration,
    ) -> Result<RpcResponse, RpcError> {
        let rpc_type = request.rpc_type();
        let id = self.inner.next_message_id();
        let (tx, rx) = oneshot::channel();
        self.inner.lock_pending().insert(id, tx);

        let mut batch = vec![RpcMessage {
            id,
            payload: Payload::Request(request),
        }];
        batch.extend(trailing.into_iter().map(|payload| RpcMessage {
            id: self.inner.next_message_id(),
            payload,
        }));

        if let Err(err) = self.inner.send(batch) {
            self.inner.lock_pending().remove(&id);
            return Err(err);
        }
        trace!(session_id = %self.inner.id, id, %rpc_type, "sent request");

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::network("session terminated")),
            Err(_) => Err(RpcError::new(
                ErrorCode::Timeout,
                format!("{rpc_type} request timed out after {}ms", timeout.as_millis()),
            )),
        };
        self.inner.lock_pending().remove(&id);

        match result {
            Ok(response) if response.rpc_type() != rpc_type => Err(RpcError::internal(format!(
                "expected {rpc_type} response, got {}",
                response.rpc_type()
            ))),
            result => result,
        }
    }

    /// Ends the session, notifying the peer.
    ///
    /// `err` is `None` for a graceful shutdown. Has no effect once the
    /// session terminated.
    pub fn end(&self, err: Option<RpcError>) {
        self.inner.end(err.unwrap_or_else(RpcError::no_error));
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u32, Waiter>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_message_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.lock_pending().contains_key(&id) {
                return id;
            }
        }
    }

    fn send(&self, messages: Vec<RpcMessage>) -> Result<(), RpcError> {
        if self.lock_state().terminated.is_some() {
            return Err(RpcError::network("session is not open"));
        }

        self.outbound
            .send(Outbound::Batch(messages))
            .map_err(|_| RpcError::network("session is not open"))
    }

    fn end(&self, cause: RpcError) {
        let alert = RpcMessage {
            id: self.next_message_id(),
            payload: Payload::ConnectionTerminationAlert(cause.clone()),
        };
        if self.send(vec![alert]).is_err() {
            return;
        }

        self.terminate(cause);
    }

    /// Closes the session locally. Only the first call has an effect.
    fn terminate(&self, cause: RpcError) {
        {
            let mut state = self.lock_state();
            if state.terminated.is_some() {
                return;
            }
            state.terminated = Some(cause.clone());
            state.init_gate = None;
        }

        self.cancel.cancel();
        let _ = self.outbound.send(Outbound::Close);

        let pending: Vec<Waiter> = self.lock_pending().drain().map(|(_, tx)| tx).collect();
        let rejection = if cause.code == ErrorCode::NetworkError {
            cause.clone()
        } else {
            RpcError::network(format!("session terminated: {cause}"))
        };
        for waiter in pending {
            let _ = waiter.send(Err(rejection.clone()));
        }

        if cause.is_no_error() {
            info!(session_id = %self.id, "session closed");
        } else {
            warn!(session_id = %self.id, %cause, "session terminated");
        }

        self.events.emit(&Event::ConnectionTerminated(cause));
    }

    /// Handles one message. Returns a gate to wait on before handling the next
    /// one if the message was an init request.
    fn dispatch(self: &Arc<Self>, message: RpcMessage) -> Option<oneshot::Receiver<()>> {
        let RpcMessage { id, payload } = message;
        match payload {
            Payload::Request(request) => return self.dispatch_request(id, request),
            Payload::Response(response) => self.settle(id, Ok(response)),
            Payload::Error(err) => self.settle(id, Err(err)),
            Payload::TunnelMessage(msg) => {
                trace!(session_id = %self.id, tunnel_id = msg.tunnel_id, len = msg.message.len(), "tunnel message");
                self.events.emit(&Event::TunnelMessage(msg));
            }
            Payload::TunnelDisconnectEvent(event) => {
                debug!(session_id = %self.id, tunnel_id = event.tunnel_id, "tunnel disconnected by peer");
                self.events.emit(&Event::TunnelDisconnect(event));
            }
            Payload::ConnectionTerminationAlert(cause) => self.terminate(cause),
        }
        None
    }

    fn settle(&self, id: u32, result: Result<RpcResponse, RpcError>) {
        let waiter = self.lock_pending().remove(&id);
        self.events.emit(&Event::Response {
            id,
            result: result.clone(),
        });

        match waiter {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!(session_id = %self.id, id, "response to unknown request"),
        }
    }

    fn dispatch_request(
        self: &Arc<Self>,
        id: u32,
        request: RpcRequest,
    ) -> Option<oneshot::Receiver<()>> {
        let is_init = matches!(request, RpcRequest::Init(_));

        let gate = {
            let mut state = self.lock_state();
            let initialized = state.metadata.is_some();
            let rejection = if is_init && (initialized || state.init_gate.is_some()) {
                Some("Client already initialised")
            } else if !is_init && !initialized {
                Some("Client not initialised")
            } else {
                None
            };

            if let Some(reason) = rejection {
                drop(state);
                debug!(session_id = %self.id, id, rpc_type = %request.rpc_type(), reason, "rejected request");
                self.reply(id, Err(RpcError::bad_request(reason)));
                return None;
            }

            is_init.then(|| {
                let (tx, rx) = oneshot::channel();
                state.init_gate = Some(tx);
                rx
            })
        };

        let event = Event::Request(IncomingRequest {
            id,
            request,
            session: Arc::downgrade(self),
            answered: Arc::new(AtomicBool::new(false)),
        });

        if self.events.emit(&event) == 0 {
            if let Event::Request(request) = &event {
                let _ = request.respond(Err(RpcError::not_supported(format!(
                    "{} is not handled by this peer",
                    request.rpc_type()
                ))));
            }
        }

        gate
    }

    fn reply(&self, id: u32, result: Result<RpcResponse, RpcError>) {
        let payload = match result {
            Ok(response) => Payload::Response(response),
            Err(err) => Payload::Error(err),
        };

        if let Err(err) = self.send(vec![RpcMessage { id, payload }]) {
            debug!(session_id = %self.id, id, %err, "failed to send response");
        }
    }
}

/// A request received from the peer.
///
/// Must be answered with [`respond`](Self::respond) exactly once. Clones
/// share the answered flag.
#[derive(Clone)]
pub struct IncomingRequest {
    id: u32,
    request: RpcRequest,
    session: Weak<Inner>,
    answered: Arc<AtomicBool>,
}

impl std::fmt::Debug for IncomingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingRequest")
            .field("id", &self.id)
            .field("rpc_type", &self.request.rpc_type())
            .finish_non_exhaustive()
    }
}

impl IncomingRequest {
    /// Returns the message id of the request.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the request.
    pub fn request(&self) -> &RpcRequest {
        &self.request
    }

    /// Returns the RPC the request belongs to.
    pub fn rpc_type(&self) -> attestor_core::RpcType {
        self.request.rpc_type()
    }

    /// Returns the session the request arrived on, if it is still alive.
    pub fn session(&self) -> Option<Session> {
        self.session.upgrade().map(|inner| Session { inner })
    }

    /// Answers the request.
    ///
    /// Fails if the request was already answered or the session is gone.
    pub fn respond(&self, result: Result<RpcResponse, RpcError>) -> Result<(), RpcError> {
        if self.answered.swap(true, Ordering::SeqCst) {
            return Err(RpcError::internal("request was already answered"));
        }

        let inner = self
            .session
            .upgrade()
            .ok_or_else(|| RpcError::network("session is not open"))?;

        if let Err(err) = &result {
            debug!(session_id = %inner.id, id = self.id, rpc_type = %self.rpc_type(), %err, "request failed");
        }
        inner.reply(self.id, result);

        if matches!(self.request, RpcRequest::Init(_)) {
            if let Some(gate) = inner.lock_state().init_gate.take() {
                let _ = gate.send(());
            }
        }

        Ok(())
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    cancel: CancellationToken,
    mut stream: FrameStream,
    initial: Vec<RpcMessage>,
) {
    let mut batch = initial;

    loop {
        for message in batch.drain(..) {
            let Some(session) = inner.upgrade() else {
                return;
            };
            let gate = session.dispatch(message);
            drop(session);

            if let Some(gate) = gate {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = gate => {}
                }
            }
        }

        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = stream.next() => frame,
        };

        let Some(session) = inner.upgrade() else {
            return;
        };

        match frame {
            Some(Ok(bytes)) => match decode_batch(&bytes) {
                Ok(messages) => batch = messages,
                Err(err) => {
                    error!(session_id = %session.id, %err, "failed to decode frame");
                    session.end(RpcError::bad_request(format!("invalid frame: {err}")));
                    return;
                }
            },
            Some(Err(err)) => {
                session.terminate(RpcError::network(err.to_string()));
                return;
            }
            None => {
                session.terminate(RpcError::no_error());
                return;
            }
        }
    }
}

async fn write_loop(
    inner: Weak<Inner>,
    mut sink: FrameSink,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        let messages = match outbound {
            Outbound::Batch(messages) => messages,
            Outbound::Close => break,
        };

        let frame = match encode_batch(&messages) {
            Ok(frame) => frame,
            Err(err) => {
                error!(%err, "failed to encode frame");
                continue;
            }
        };

        if let Err(err) = sink.send(frame).await {
            if let Some(inner) = inner.upgrade() {
                inner.terminate(RpcError::network(err.to_string()));
            }
            break;
        }
    }

    let _ = sink.close().await;
}

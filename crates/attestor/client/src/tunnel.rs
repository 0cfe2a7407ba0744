//! Client side of a tunnel: a byte stream relayed by the attestor.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use attestor_common::{Event, EventKind, Session, SubscriptionId};
use attestor_core::{
    msg::{CreateTunnelRequest, DisconnectTunnelRequest, RpcRequest, TunnelMessage},
    ErrorCode, Payload, RpcError, Sender, Transcript,
};
use tracing::{debug, trace};

use crate::{
    client::AttestorClient,
    error::{ClientError, ErrorKind},
};

type MessageHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;
type CloseHandler = Box<dyn FnOnce(Option<RpcError>) + Send>;

/// Callbacks of an [`RpcTunnel`].
pub struct TunnelHandlers {
    /// Called with every chunk the target sent.
    pub on_message: MessageHandler,
    /// Called once when the tunnel closes, with the cause if it failed.
    pub on_close: CloseHandler,
}

struct Inner {
    request: CreateTunnelRequest,
    session: Session,
    closed: AtomicBool,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    on_close: Mutex<Option<CloseHandler>>,
    transcript: Mutex<Transcript>,
}

impl Inner {
    fn record(&self, sender: Sender, data: &[u8]) {
        self.transcript
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sender, data);
    }

    /// Marks the tunnel closed and unsubscribes. Returns `false` if it was
    /// already closed.
    fn close_local(&self, err: Option<RpcError>) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for id in subscriptions {
            self.session.off(id);
        }

        debug!(tunnel_id = self.request.id, ?err, "tunnel closed");
        let handler = self
            .on_close
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handler) = handler {
            handler(err);
        }

        true
    }
}

/// A tunnel opened through the attestor.
///
/// Cheap to clone, all clones refer to the same tunnel.
#[derive(Clone)]
pub struct RpcTunnel {
    inner: Arc<Inner>,
}

opaque_debug::implement!(RpcTunnel);

impl RpcTunnel {
    /// Opens a tunnel.
    ///
    /// `initial` is sent in the same frame as the create request, saving a
    /// round trip for protocols where the client speaks first.
    pub async fn create(
        client: &AttestorClient,
        request: CreateTunnelRequest,
        handlers: TunnelHandlers,
        initial: Option<Vec<u8>>,
    ) -> Result<Self, ClientError> {
        let session = client.session().clone();
        let tunnel_id = request.id;

        let inner = Arc::new(Inner {
            request: request.clone(),
            session: session.clone(),
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            on_close: Mutex::new(Some(handlers.on_close)),
            transcript: Mutex::new(Transcript::new()),
        });

        // Subscribe first, the target may answer before the create response
        // is processed.
        let on_message = handlers.on_message;
        let weak = Arc::downgrade(&inner);
        let message_sub = session.on(EventKind::TunnelMessage, move |event| {
            if let Event::TunnelMessage(msg) = event {
                if msg.tunnel_id == tunnel_id {
                    trace!(tunnel_id, len = msg.message.len(), "tunnel data");
                    if let Some(inner) = weak.upgrade() {
                        inner.record(Sender::Server, &msg.message);
                    }
                    on_message(msg.message.clone());
                }
            }
        });

        let weak = Arc::downgrade(&inner);
        let disconnect_sub = session.on(EventKind::TunnelDisconnect, move |event| {
            if let Event::TunnelDisconnect(disconnect) = event {
                if disconnect.tunnel_id == tunnel_id {
                    if let Some(inner) = weak.upgrade() {
                        inner.close_local(disconnect.error.clone());
                    }
                }
            }
        });

        let weak = Arc::downgrade(&inner);
        let terminated_sub = session.on(EventKind::ConnectionTerminated, move |event| {
            if let Event::ConnectionTerminated(cause) = event {
                if let Some(inner) = weak.upgrade() {
                    inner.close_local((!cause.is_no_error()).then(|| cause.clone()));
                }
            }
        });

        inner
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend([message_sub, disconnect_sub, terminated_sub]);

        // Recorded before sending, the answer may arrive ahead of the create
        // response.
        let trailing = initial
            .filter(|data| !data.is_empty())
            .inspect(|data| inner.record(Sender::Client, data))
            .map(|message| Payload::TunnelMessage(TunnelMessage { tunnel_id, message }))
            .into_iter()
            .collect();

        let timeout = session.config().request_timeout;
        if let Err(err) = session
            .request_with(RpcRequest::CreateTunnel(request), trailing, timeout)
            .await
        {
            // Nothing to disconnect, the attestor registered no tunnel.
            inner.on_close.lock().unwrap_or_else(|p| p.into_inner()).take();
            inner.close_local(Some(err.clone()));
            return Err(err.into());
        }
        debug!(tunnel_id, "tunnel created");

        Ok(Self { inner })
    }

    /// Returns the tunnel id.
    pub fn id(&self) -> u32 {
        self.inner.request.id
    }

    /// Returns the request the tunnel was created with.
    pub fn request(&self) -> &CreateTunnelRequest {
        &self.inner.request
    }

    /// Returns `true` once the tunnel closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Returns a copy of the bytes exchanged so far.
    ///
    /// Client entries are the chunks handed to the session, server entries
    /// the chunks received from the attestor.
    pub fn transcript(&self) -> Transcript {
        self.inner
            .transcript
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Sends `data` to the target.
    pub fn write(&self, data: Vec<u8>) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::msg(
                ErrorKind::Tunnel,
                format!("tunnel {} is already closed", self.id()),
            ));
        }

        // The lock is held across the send so an echo cannot be recorded
        // ahead of the chunk that caused it.
        let mut transcript = self
            .inner
            .transcript
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.inner
            .session
            .send_payloads(vec![Payload::TunnelMessage(TunnelMessage {
                tunnel_id: self.id(),
                message: data.clone(),
            })])?;
        transcript.push(Sender::Client, data);

        Ok(())
    }

    /// Closes the tunnel and asks the attestor to disconnect it.
    ///
    /// Only the first call has an effect.
    pub async fn close(&self, err: Option<RpcError>) -> Result<(), ClientError> {
        if !self.inner.close_local(err) || !self.inner.session.is_open() {
            return Ok(());
        }

        let disconnect = RpcRequest::DisconnectTunnel(DisconnectTunnelRequest { id: self.id() });
        match self
            .inner
            .session
            .request(disconnect)
            .await
        {
            Ok(_) => Ok(()),
            // The attestor already dropped the tunnel.
            Err(err) if err.code == ErrorCode::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Stops handling events for the tunnel without disconnecting it, for
    /// when the attestor takes it over, as with a claim.
    pub(crate) fn detach(&self) {
        self.inner.on_close.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.inner.close_local(None);
    }
}

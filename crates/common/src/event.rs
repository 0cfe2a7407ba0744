//! Publish/subscribe registry for session events.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use attestor_core::{
    msg::{TunnelDisconnectEvent, TunnelMessage},
    RpcError, RpcResponse,
};
use tokio::sync::mpsc;

use crate::session::IncomingRequest;

/// Kinds of [`Event`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A response to one of our requests arrived.
    Response,
    /// The peer sent a request.
    Request,
    /// Bytes arrived for a tunnel.
    TunnelMessage,
    /// The peer closed a tunnel.
    TunnelDisconnect,
    /// The session terminated.
    ConnectionTerminated,
}

/// An event published by a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub enum Event {
    /// A response to one of our requests arrived.
    Response {
        /// Id of the request.
        id: u32,
        /// The response.
        result: Result<RpcResponse, RpcError>,
    },
    /// The peer sent a request which must be answered.
    Request(IncomingRequest),
    /// Bytes arrived for a tunnel.
    TunnelMessage(TunnelMessage),
    /// The peer closed a tunnel.
    TunnelDisconnect(TunnelDisconnectEvent),
    /// The session terminated. Fires exactly once.
    ConnectionTerminated(RpcError),
}

impl Event {
    /// Returns the kind of the event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Response { .. } => EventKind::Response,
            Event::Request(_) => EventKind::Request,
            Event::TunnelMessage(_) => EventKind::TunnelMessage,
            Event::TunnelDisconnect(_) => EventKind::TunnelDisconnect,
            Event::ConnectionTerminated(_) => EventKind::ConnectionTerminated,
        }
    }
}

/// Identifies a subscription, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Registry of event handlers keyed by [`EventKind`].
#[derive(Default)]
pub struct EventRegistry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
}

opaque_debug::implement!(EventRegistry);

impl EventRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns `false` if it was already removed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.lock();
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(sub, _)| *sub == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Forwards events of `kind` into a channel.
    ///
    /// The subscription stays registered until removed with [`off`](Self::off).
    pub fn subscribe(&self, kind: EventKind) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on(kind, move |event| {
            // The receiver may be gone, in which case the event is dropped.
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Calls every handler registered for the kind of `event`, in
    /// registration order. Returns the number of handlers called.
    pub fn emit(&self, event: &Event) -> usize {
        // Handlers may (un)subscribe, so they are called without the lock held.
        let handlers: Vec<Handler> = self
            .lock()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EventKind, Vec<(SubscriptionId, Handler)>>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

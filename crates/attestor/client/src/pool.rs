//! Reuse of attestor sessions.

use std::{collections::HashMap, future::Future, sync::Arc};

use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::{client::AttestorClient, error::ClientError};

type Slot = Arc<OnceCell<AttestorClient>>;

/// Keeps one open client per attestor URL.
///
/// A client whose session terminated is replaced on the next lookup.
#[derive(Debug, Clone, Default)]
pub struct ClientPool {
    clients: Arc<Mutex<HashMap<String, Slot>>>,
}

impl ClientPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the open client for `url`, or creates one with `create`.
    ///
    /// Concurrent lookups of the same URL wait for a single creation, other
    /// URLs are not held up by it. A failed creation is retried by the next
    /// lookup.
    pub async fn get_or_create<F, Fut>(&self, url: &str, create: F) -> Result<AttestorClient, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AttestorClient, ClientError>>,
    {
        let slot = {
            let mut clients = self.clients.lock().await;
            let slot = clients.entry(url.to_string()).or_default();
            if slot.get().is_some_and(|client| !client.is_open()) {
                debug!(url, "replacing terminated client");
                *slot = Slot::default();
            }
            slot.clone()
        };

        slot.get_or_try_init(create).await.cloned()
    }

    /// Closes and forgets every client.
    pub async fn close_all(&self) {
        for (_, slot) in self.clients.lock().await.drain() {
            if let Some(client) = slot.get() {
                client.close();
            }
        }
    }

    /// Returns the number of clients in the pool, open or not.
    pub async fn len(&self) -> usize {
        self.clients
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Returns `true` if the pool holds no client.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::AttestorClientConfig;
    use attestor_common::{transport::memory, Event, EventKind, Session, SessionConfig, SessionMetadata};
    use attestor_core::{
        msg::{InitRequest, InitResponse, RpcRequest, RpcResponse},
        Payload, RpcMessage, PROTOCOL_VERSION,
    };
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::Notify;

    async fn client() -> AttestorClient {
        let ((client_sink, client_stream), (server_sink, server_stream)) = memory();
        let server = Session::new(server_sink, server_stream, SessionConfig::default());
        let responder = server.clone();
        server.on(EventKind::Request, move |event| {
            if let Event::Request(request) = event {
                if let RpcRequest::Init(init) = request.request() {
                    responder.set_initialized(SessionMetadata {
                        client_version: init.client_version,
                        signature_type: init.signature_type,
                        auth: None,
                    });
                    let _ = request.respond(Ok(RpcResponse::Init(InitResponse {})));
                }
            }
        });
        server.start();

        let session = Session::new(client_sink, client_stream, SessionConfig::default());
        let init_id = session.next_message_id();
        session
            .send(vec![RpcMessage {
                id: init_id,
                payload: Payload::Request(RpcRequest::Init(InitRequest {
                    client_version: PROTOCOL_VERSION,
                    signature_type: Default::default(),
                    auth: None,
                })),
            }])
            .unwrap();

        let config = AttestorClientConfig::builder().url("memory").build().unwrap();
        AttestorClient::initialize(&config, session, init_id)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reuses_open_client() {
        let pool = ClientPool::new();
        let created = AtomicUsize::new(0);

        for _ in 0..3 {
            pool.get_or_create("ws://a", || async {
                created.fetch_add(1, Ordering::SeqCst);
                Ok(client().await)
            })
            .await
            .unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_slow_creation_does_not_block_other_urls() {
        let pool = ClientPool::new();
        let release = Arc::new(Notify::new());

        let slow = tokio::spawn({
            let pool = pool.clone();
            let release = release.clone();
            async move {
                pool.get_or_create("ws://a", || async move {
                    release.notified().await;
                    Ok(client().await)
                })
                .await
            }
        });
        tokio::task::yield_now().await;

        let other = tokio::time::timeout(
            Duration::from_secs(5),
            pool.get_or_create("ws://b", || async { Ok(client().await) }),
        )
        .await
        .expect("lookup of another URL waited for the pending creation")
        .unwrap();
        assert!(other.is_open());
        assert_eq!(pool.len().await, 1);

        release.notify_one();
        let slow = slow.await.unwrap().unwrap();
        assert!(slow.is_open());
        assert_eq!(pool.len().await, 2);

        // The slot is filled, no second creation runs.
        let again = pool
            .get_or_create("ws://a", || async {
                Err(ClientError::msg(crate::ErrorKind::Internal, "created twice"))
            })
            .await
            .unwrap();
        assert_eq!(again.session().id(), slow.session().id());
    }

    #[tokio::test]
    async fn test_replaces_terminated_client() {
        let pool = ClientPool::new();

        let first = pool
            .get_or_create("ws://a", || async { Ok(client().await) })
            .await
            .unwrap();
        first.close();
        assert!(!first.is_open());

        let second = pool
            .get_or_create("ws://a", || async { Ok(client().await) })
            .await
            .unwrap();
        assert!(second.is_open());
        assert_ne!(first.session().id(), second.session().id());
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_cached() {
        let pool = ClientPool::new();

        let err = pool
            .get_or_create("ws://a", || async {
                Err(ClientError::msg(crate::ErrorKind::Connection, "refused"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Connection);
        assert!(pool.is_empty().await);

        pool.close_all().await;
    }
}

//! Server side of a tunnel: a TCP socket to the target host.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use attestor_core::{msg::CreateTunnelRequest, ErrorCode, RpcError, Sender, Transcript};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::proxy::{GeoProxy, ProxiedStream, ProxyError};

const READ_BUF_LEN: usize = 16 * 1024;

/// How tunnels reach their target.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Time allowed to establish the connection.
    pub connect_timeout: Duration,
    /// Proxy used for tunnels with a geolocation.
    pub proxy: Option<GeoProxy>,
}

type MessageHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;
type CloseHandler = Box<dyn FnOnce(Option<RpcError>) + Send>;

/// Callbacks of a [`TcpTunnel`].
pub struct TunnelHandlers {
    /// Called with every chunk read from the socket.
    pub on_message: MessageHandler,
    /// Called once when the socket closes on its own or fails. `None` for a
    /// clean close by the target.
    pub on_close: CloseHandler,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel {0} is already closed")]
    AlreadyClosed(u32),
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        source: io::Error,
    },
    #[error("timed out connecting to {host}:{port}")]
    Timeout { host: String, port: u16 },
    #[error("geolocation requested but no proxy is configured")]
    NoProxy,
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl From<TunnelError> for RpcError {
    fn from(err: TunnelError) -> Self {
        let code = match &err {
            TunnelError::AlreadyClosed(_) | TunnelError::Connect { .. } => ErrorCode::NetworkError,
            TunnelError::Timeout { .. } => ErrorCode::Timeout,
            TunnelError::NoProxy | TunnelError::Proxy(_) => ErrorCode::ProxyError,
        };
        RpcError::new(code, err.to_string())
    }
}

/// A TCP connection to a tunnel's target, recording everything exchanged.
pub struct TcpTunnel {
    request: CreateTunnelRequest,
    transcript: Mutex<Transcript>,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    closed: AtomicBool,
    on_close: Mutex<Option<CloseHandler>>,
    cancel: CancellationToken,
}

opaque_debug::implement!(TcpTunnel);

impl TcpTunnel {
    /// Connects to the target of `request`.
    ///
    /// Nothing is spawned unless the connection succeeds within the timeout.
    pub async fn connect(
        request: CreateTunnelRequest,
        options: &ConnectOptions,
        handlers: TunnelHandlers,
    ) -> Result<Arc<Self>, TunnelError> {
        let ProxiedStream { stream, buffered } =
            tokio::time::timeout(options.connect_timeout, open_socket(&request, options))
            .await
            .map_err(|_| TunnelError::Timeout {
                host: request.host.clone(),
                port: request.port,
            })??;
        let _ = stream.set_nodelay(true);
        debug!(tunnel_id = request.id, host = %request.host, port = request.port, "tunnel connected");

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let tunnel = Arc::new(Self {
            request,
            transcript: Mutex::new(Transcript::new()),
            writer: tx,
            closed: AtomicBool::new(false),
            on_close: Mutex::new(Some(handlers.on_close)),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(read_loop(tunnel.clone(), reader, buffered, handlers.on_message));
        tokio::spawn(write_loop(tunnel.clone(), writer, rx));

        Ok(tunnel)
    }

    /// Returns the tunnel id.
    pub fn id(&self) -> u32 {
        self.request.id
    }

    /// Returns the request the tunnel was created with.
    pub fn request(&self) -> &CreateTunnelRequest {
        &self.request
    }

    /// Returns `true` once the tunnel closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns a snapshot of the transcript.
    pub fn transcript(&self) -> Transcript {
        self.lock_transcript().clone()
    }

    /// Queues `data` to be written to the target. It enters the transcript
    /// once written.
    pub fn write(&self, data: Vec<u8>) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::AlreadyClosed(self.id()));
        }

        trace!(tunnel_id = self.id(), len = data.len(), "writing to target");
        self.writer
            .send(data)
            .map_err(|_| TunnelError::AlreadyClosed(self.id()))
    }

    /// Closes the tunnel because of a socket event, notifying the close
    /// handler. Only the first close has an effect.
    pub fn close(&self, err: Option<RpcError>) {
        self.close_inner(err, true);
    }

    /// Closes the tunnel on request of the session without notifying the
    /// close handler.
    pub fn shutdown(&self) {
        self.close_inner(None, false);
    }

    fn close_inner(&self, err: Option<RpcError>, notify: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(tunnel_id = self.id(), ?err, "tunnel closed");
        self.cancel.cancel();

        let handler = self
            .on_close
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let (true, Some(handler)) = (notify, handler) {
            handler(err);
        }
    }

    fn lock_transcript(&self) -> MutexGuard<'_, Transcript> {
        self.transcript
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn open_socket(
    request: &CreateTunnelRequest,
    options: &ConnectOptions,
) -> Result<ProxiedStream, TunnelError> {
    match &request.geo_location {
        Some(geo_location) => {
            let proxy = options.proxy.as_ref().ok_or(TunnelError::NoProxy)?;
            Ok(proxy
                .connect(geo_location, &request.host, request.port)
                .await?)
        }
        None => TcpStream::connect((request.host.as_str(), request.port))
            .await
            .map(|stream| ProxiedStream {
                stream,
                buffered: Vec::new(),
            })
            .map_err(|source| TunnelError::Connect {
                host: request.host.clone(),
                port: request.port,
                source,
            }),
    }
}

async fn read_loop(
    tunnel: Arc<TcpTunnel>,
    mut reader: OwnedReadHalf,
    buffered: Vec<u8>,
    on_message: MessageHandler,
) {
    if !buffered.is_empty() {
        tunnel.lock_transcript().push(Sender::Server, buffered.clone());
        on_message(buffered);
    }

    let mut buf = vec![0u8; READ_BUF_LEN];
    loop {
        let read = tokio::select! {
            _ = tunnel.cancel.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                tunnel.close(None);
                return;
            }
            Ok(n) => {
                let data = buf[..n].to_vec();
                trace!(tunnel_id = tunnel.id(), len = n, "read from target");
                tunnel.lock_transcript().push(Sender::Server, data.clone());
                on_message(data);
            }
            Err(err) => {
                tunnel.close(Some(RpcError::network(err.to_string())));
                return;
            }
        }
    }
}

async fn write_loop(
    tunnel: Arc<TcpTunnel>,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    loop {
        // Writes still queued at shutdown are dropped.
        let data = tokio::select! {
            biased;
            _ = tunnel.cancel.cancelled() => break,
            data = rx.recv() => data,
        };
        let Some(data) = data else {
            break;
        };

        if let Err(err) = writer.write_all(&data).await {
            tunnel.close(Some(RpcError::network(err.to_string())));
            break;
        }
        tunnel.lock_transcript().push(Sender::Client, data);
    }

    let _ = writer.shutdown().await;
}

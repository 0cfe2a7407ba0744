//! TLS client connections tunnelled through an attestor.

use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use attestor_core::{msg::CreateTunnelRequest, RpcError, Transcript};
use rustls::{ClientConfig, ClientConnection, OwnedTrustAnchor, RootCertStore, ServerName};
use tls_core::{RecordSplitter, Sender};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    client::AttestorClient,
    error::{ClientError, ErrorKind},
    reveal::SecretLog,
    tunnel::{RpcTunnel, TunnelHandlers},
};

/// Configuration of a [`TlsTunnel`].
#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(build_fn(error = "ClientError"))]
pub struct TlsTunnelConfig {
    /// Name the server certificate is checked against. Defaults to the
    /// tunnel host.
    #[builder(setter(into, strip_option), default)]
    server_name: Option<String>,
    /// Root certificate store used to verify the server.
    #[builder(default = "default_root_store()")]
    root_cert_store: RootCertStore,
    /// Protocol versions offered to the server.
    #[builder(default = "rustls::DEFAULT_VERSIONS.to_vec()")]
    protocol_versions: Vec<&'static rustls::SupportedProtocolVersion>,
}

impl TlsTunnelConfig {
    /// Creates a new builder for `TlsTunnelConfig`.
    pub fn builder() -> TlsTunnelConfigBuilder {
        TlsTunnelConfigBuilder::default()
    }
}

enum TunnelEvent {
    Data(Vec<u8>),
    Closed(Option<RpcError>),
}

/// Splits both directions of the connection into records as they pass.
#[derive(Debug, Default)]
struct RecordLog {
    client: RecordSplitter,
    server: RecordSplitter,
    transcript: Transcript,
}

impl RecordLog {
    fn push(&mut self, sender: Sender, data: &[u8]) -> Result<(), ClientError> {
        let splitter = match sender {
            Sender::Client => &mut self.client,
            Sender::Server => &mut self.server,
        };
        splitter.push(data);

        while let Some(record) = splitter
            .next_record_bytes()
            .map_err(|err| ClientError::new(ErrorKind::Tls, Some(Box::new(err))))?
        {
            trace!(%sender, len = record.len(), "record");
            self.transcript.push(sender, record);
        }
        Ok(())
    }
}

/// A TLS connection to the target of a tunnel.
///
/// The attestor sees, and records, only ciphertext. Every record sent or
/// received is kept so the connection can be claimed afterwards.
pub struct TlsTunnel {
    tunnel: RpcTunnel,
    conn: ClientConnection,
    secrets: Arc<SecretLog>,
    events: mpsc::UnboundedReceiver<TunnelEvent>,
    records: RecordLog,
    /// Set once the tunnel closed, with the cause if it failed.
    closed: Option<Option<RpcError>>,
}

opaque_debug::implement!(TlsTunnel);

impl TlsTunnel {
    /// Opens a tunnel and performs the TLS handshake over it.
    ///
    /// The ClientHello travels in the same frame as the tunnel request.
    pub async fn connect(
        client: &AttestorClient,
        request: CreateTunnelRequest,
        config: &TlsTunnelConfig,
    ) -> Result<Self, ClientError> {
        let secrets = Arc::new(SecretLog::new());
        let mut tls_config = ClientConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&config.protocol_versions)?
            .with_root_certificates(config.root_cert_store.clone())
            .with_no_client_auth();
        tls_config.key_log = secrets.clone();

        let server_name = config.server_name.as_deref().unwrap_or(&request.host);
        let server_name = ServerName::try_from(server_name)
            .map_err(|err| ClientError::new(ErrorKind::Tls, Some(Box::new(err))))?;
        let mut conn = ClientConnection::new(Arc::new(tls_config), server_name)?;

        let (tx, events) = mpsc::unbounded_channel();
        let data_tx = tx.clone();
        let handlers = TunnelHandlers {
            on_message: Box::new(move |data| {
                let _ = data_tx.send(TunnelEvent::Data(data));
            }),
            on_close: Box::new(move |err| {
                let _ = tx.send(TunnelEvent::Closed(err));
            }),
        };

        let mut records = RecordLog::default();
        let hello = write_tls(&mut conn)?;
        records.push(Sender::Client, &hello)?;

        debug!(tunnel_id = request.id, host = %request.host, port = request.port, "opening TLS tunnel");
        let tunnel = RpcTunnel::create(client, request, handlers, Some(hello)).await?;

        let mut tls = Self {
            tunnel,
            conn,
            secrets,
            events,
            records,
            closed: None,
        };

        let timeout = client.session().config().request_timeout;
        let result = match tokio::time::timeout(timeout, tls.complete_handshake()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::msg(
                ErrorKind::Tls,
                format!("TLS handshake timed out after {}ms", timeout.as_millis()),
            )),
        };
        if let Err(err) = result {
            let _ = tls.tunnel.close(None).await;
            return Err(err);
        }

        debug!(
            tunnel_id = tls.tunnel.id(),
            version = ?tls.conn.protocol_version(),
            suite = ?tls.conn.negotiated_cipher_suite().map(|suite| suite.suite()),
            "TLS handshake complete"
        );
        Ok(tls)
    }

    async fn complete_handshake(&mut self) -> Result<(), ClientError> {
        while self.conn.is_handshaking() {
            self.flush()?;
            if !self.receive().await? {
                return Err(self.closed_error("during the TLS handshake"));
            }
        }
        // TLS 1.3 completes before the client's Finished is sent.
        self.flush()
    }

    /// Returns the tunnel the connection runs over.
    pub fn tunnel(&self) -> &RpcTunnel {
        &self.tunnel
    }

    /// Returns the records exchanged so far, one record per entry.
    pub fn transcript(&self) -> &Transcript {
        &self.records.transcript
    }

    pub(crate) fn secrets(&self) -> &SecretLog {
        &self.secrets
    }

    /// Sends application data.
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), ClientError> {
        if self.closed.is_some() {
            return Err(self.closed_error("before writing"));
        }
        self.conn.writer().write_all(data).map_err(tls_io)?;
        self.flush()
    }

    /// Returns the next chunk of application data, or `None` once the
    /// server closed the connection.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, ClientError> {
        loop {
            let mut buf = Vec::new();
            match self.conn.reader().read_to_end(&mut buf) {
                // close_notify received
                Ok(_) => return Ok((!buf.is_empty()).then_some(buf)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !buf.is_empty() {
                        return Ok(Some(buf));
                    }
                }
                Err(err) => return Err(tls_io(err)),
            }

            if !self.receive().await? {
                return match self.closed.as_ref().and_then(|err| err.clone()) {
                    Some(err) => Err(err.into()),
                    None => Ok(None),
                };
            }
        }
    }

    /// Reads application data until the server closes the connection.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, ClientError> {
        let mut out = Vec::new();
        while let Some(data) = self.read().await? {
            out.extend_from_slice(&data);
        }
        Ok(out)
    }

    /// Sends close_notify and closes the tunnel.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.send_close_notify();
        self.tunnel.close(None).await
    }

    /// Sends close_notify, keeping the tunnel open so the server's
    /// remaining records can still be read.
    pub fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
        if self.closed.is_none() {
            if let Err(err) = self.flush() {
                debug!(tunnel_id = self.tunnel.id(), %err, "failed to send close_notify");
            }
        }
    }

    /// Writes pending TLS records to the tunnel.
    fn flush(&mut self) -> Result<(), ClientError> {
        let data = write_tls(&mut self.conn)?;
        if data.is_empty() {
            return Ok(());
        }

        self.records.push(Sender::Client, &data)?;
        self.tunnel.write(data)
    }

    /// Waits for data from the tunnel and feeds it to the TLS connection.
    /// Returns `false` once the tunnel closed.
    async fn receive(&mut self) -> Result<bool, ClientError> {
        if self.closed.is_some() {
            return Ok(false);
        }

        let data = match self.events.recv().await {
            Some(TunnelEvent::Data(data)) => data,
            Some(TunnelEvent::Closed(err)) => {
                debug!(tunnel_id = self.tunnel.id(), ?err, "tunnel closed");
                self.closed = Some(err);
                return Ok(false);
            }
            None => {
                self.closed = Some(None);
                return Ok(false);
            }
        };

        self.records.push(Sender::Server, &data)?;

        let mut rd = data.as_slice();
        while !rd.is_empty() {
            self.conn.read_tls(&mut rd).map_err(tls_io)?;
            if let Err(err) = self.conn.process_new_packets() {
                // Deliver the alert rustls queued.
                let _ = self.flush();
                return Err(err.into());
            }
        }

        self.flush()?;
        Ok(true)
    }

    fn closed_error(&self, when: &str) -> ClientError {
        match self.closed.as_ref().and_then(|err| err.clone()) {
            Some(err) => err.into(),
            None => ClientError::msg(ErrorKind::Tunnel, format!("tunnel closed {when}")),
        }
    }
}

fn write_tls(conn: &mut ClientConnection) -> Result<Vec<u8>, ClientError> {
    let mut buf = Vec::new();
    while conn.wants_write() {
        conn.write_tls(&mut buf).map_err(tls_io)?;
    }
    Ok(buf)
}

fn tls_io(err: io::Error) -> ClientError {
    ClientError::new(ErrorKind::Tls, Some(Box::new(err)))
}

/// Returns the Mozilla root store.
pub fn default_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject.as_ref(),
            ta.subject_public_key_info.as_ref(),
            ta.name_constraints.as_ref().map(|nc| nc.as_ref()),
        )
    }));

    root_store
}

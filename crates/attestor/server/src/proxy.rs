//! HTTPS CONNECT proxy used for tunnels with a geolocation.

use std::io;

use futures::TryFutureExt;
use http_body_util::{BodyExt, Empty};
use hyper::{
    body::Bytes,
    client::conn::http1::{Parts, SendRequest},
    ext::ReasonPhrase,
    header::HOST,
    Method, Request,
};
use hyper_util::rt::TokioIo;
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, warn};

/// Placeholder in the proxy address replaced with the country code.
const GEO_PLACEHOLDER: &str = "{geoLocation}";

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("proxy HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid CONNECT request: {0}")]
    Request(#[from] http::Error),
    #[error("proxy refused to connect to a restricted target")]
    Restricted,
    #[error("proxy refused CONNECT with status {0}")]
    Refused(u16),
    #[error("could not resolve {0}")]
    Unresolved(String),
}

/// A socket tunnelled through the proxy.
#[derive(Debug)]
pub struct ProxiedStream {
    pub stream: TcpStream,
    /// Bytes from the target which arrived with the proxy response.
    pub buffered: Vec<u8>,
}

/// A CONNECT proxy whose exit country is picked per tunnel.
#[derive(Debug, Clone)]
pub struct GeoProxy {
    template: String,
}

impl GeoProxy {
    /// Creates a proxy from an address template such as
    /// `{geoLocation}.proxy.example:8080`.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Returns the proxy address for `geo_location`.
    pub fn address(&self, geo_location: &str) -> String {
        self.template
            .replace(GEO_PLACEHOLDER, &geo_location.to_ascii_lowercase())
    }

    /// Connects to `host:port` through the proxy for `geo_location`.
    ///
    /// If the proxy rejects the host name as restricted, the name is resolved
    /// locally and the connection retried with the address so the proxy does
    /// not see which host is being contacted.
    pub async fn connect(
        &self,
        geo_location: &str,
        host: &str,
        port: u16,
    ) -> Result<ProxiedStream, ProxyError> {
        let proxy = self.address(geo_location);

        match connect_via(&proxy, host, port).await {
            Err(ProxyError::Restricted) => {
                let addr = lookup_host((host, port))
                    .await?
                    .next()
                    .ok_or_else(|| ProxyError::Unresolved(host.to_string()))?;
                warn!(host, %addr, "proxy rejected host as restricted, retrying with address");
                connect_via(&proxy, &addr.ip().to_string(), port).await
            }
            result => result,
        }
    }
}

/// Opens a tunnel to `host:port` through the CONNECT proxy at `proxy`.
pub async fn connect_via(
    proxy: &str,
    host: &str,
    port: u16,
) -> Result<ProxiedStream, ProxyError> {
    let socket = TcpStream::connect(proxy).await?;
    let target = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };

    let (sender, connection) =
        hyper::client::conn::http1::handshake(TokioIo::new(socket)).await?;

    // Resolves once the proxy accepted the CONNECT, handing the socket back.
    let connection = connection.without_shutdown().map_err(ProxyError::from);

    // The sender is moved into the exchange, so a refused CONNECT also
    // ends the connection.
    let exchange = send_connect(sender, proxy, target);

    let (Parts { io, read_buf, .. }, ()) = tokio::try_join!(connection, exchange)?;

    Ok(ProxiedStream {
        stream: io.into_inner(),
        buffered: read_buf.to_vec(),
    })
}

async fn send_connect(
    mut sender: SendRequest<Empty<Bytes>>,
    proxy: &str,
    target: String,
) -> Result<(), ProxyError> {
    let request = Request::builder()
        .method(Method::CONNECT)
        .uri(target.as_str())
        .header(HOST, target.as_str())
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await?;

    let status = response.status();
    debug!(proxy, target, %status, "proxy CONNECT response");
    if status.is_success() {
        return Ok(());
    }

    let reason = response
        .extensions()
        .get::<ReasonPhrase>()
        .map(|reason| reason.as_bytes().to_vec())
        .unwrap_or_default();
    let body = response
        .into_body()
        .collect()
        .await
        .map(|body| body.to_bytes())
        .unwrap_or_default();
    if mentions_restricted(&reason) || mentions_restricted(&body) {
        Err(ProxyError::Restricted)
    } else {
        Err(ProxyError::Refused(status.as_u16()))
    }
}

fn mentions_restricted(text: &[u8]) -> bool {
    String::from_utf8_lossy(text)
        .to_ascii_lowercase()
        .contains("restricted")
}

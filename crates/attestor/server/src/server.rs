use axum::{
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use eyre::{eyre, Result};
use std::{
    fs::File as StdFile,
    io::BufReader,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tls_core::{CertificateDer, RootCertStore, ServerCertVerifier};
use tokio::{net::TcpListener, sync::Semaphore};
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::{
    claim::ClaimVerifier,
    config::{AttestationProperties, AttestorServerProperties},
    error::AttestorServerError,
    providers::ProviderRegistry,
    proxy::GeoProxy,
    service::upgrade_websocket,
    signing::{get_attestor_key, public_key_hex},
    tunnel::ConnectOptions,
    types::{AttestorGlobals, InfoResponse},
};

/// Start the attestor server on the configured address
#[tracing::instrument(skip(config))]
pub async fn run_server(config: &AttestorServerProperties) -> Result<(), AttestorServerError> {
    let attestor_address = SocketAddr::new(
        config.server.host.parse::<IpAddr>().map_err(|err| {
            eyre!("Failed to parse attestor host address from server config: {err}")
        })?,
        config.server.port,
    );
    let listener = TcpListener::bind(attestor_address)
        .await
        .map_err(|err| eyre!("Failed to bind server address to tcp listener: {err}"))?;

    info!("Listening for TCP traffic at {}", attestor_address);

    serve(listener, config).await
}

/// Serve client sessions on `listener` until the server fails
pub async fn serve(
    listener: TcpListener,
    config: &AttestorServerProperties,
) -> Result<(), AttestorServerError> {
    let attestor_globals = build_globals(config).await?;

    // Parameters needed for the info endpoint
    let version = env!("CARGO_PKG_VERSION").to_string();
    let address = attestor_globals.key.address().to_string();
    let public_key = public_key_hex(&attestor_globals.key);

    // Parameters needed for the root / endpoint
    let html_info = Html(
        config
            .server
            .html_info
            .replace("{version}", &version)
            .replace("{address}", &address),
    );

    let router = Router::new()
        .route(
            "/",
            get(|| async move { (StatusCode::OK, html_info).into_response() }),
        )
        .route(
            "/healthcheck",
            get(|| async move { (StatusCode::OK, "Ok").into_response() }),
        )
        .route(
            "/info",
            get(|| async move {
                (
                    StatusCode::OK,
                    Json(InfoResponse {
                        version,
                        address,
                        public_key,
                    }),
                )
                    .into_response()
            }),
        )
        .route("/ws", get(upgrade_websocket))
        .layer(CorsLayer::permissive())
        .with_state(attestor_globals);

    axum::serve(listener, router)
        .await
        .map_err(|err| AttestorServerError::Connection(err.to_string()))
}

async fn build_globals(config: &AttestorServerProperties) -> Result<AttestorGlobals> {
    let key = Arc::new(get_attestor_key(&config.attestation).await?);
    info!(address = %key.address(), "Loaded attestor signing key");

    let cert_verifier = Arc::new(load_cert_verifier(&config.attestation)?);
    let claim_verifier = ClaimVerifier::new(
        key.clone(),
        cert_verifier,
        Arc::new(ProviderRegistry::new()),
        config.attestation.max_timestamp_diff_secs,
    );

    let connect_options = ConnectOptions {
        connect_timeout: Duration::from_secs(config.attestation.connect_timeout_secs),
        proxy: config.proxy.url.clone().map(GeoProxy::new),
    };
    if connect_options.proxy.is_none() {
        debug!("No geolocation proxy configured");
    }

    Ok(AttestorGlobals::new(
        key,
        claim_verifier,
        config.auth.clone(),
        connect_options,
        Duration::from_secs(config.attestation.request_timeout_secs),
        Arc::new(Semaphore::new(config.concurrency.max_sessions)),
    ))
}

/// Builds the certificate verifier trusting the Mozilla roots and any extra
/// roots from the config
fn load_cert_verifier(config: &AttestationProperties) -> Result<ServerCertVerifier> {
    let mut extra = RootCertStore::empty();
    for path in &config.extra_root_cert_paths {
        let file = StdFile::open(path)
            .map_err(|err| eyre!("Failed to open root certificate file {path}: {err}"))?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(file))
            .map_err(|err| eyre!("Failed to read root certificates from {path}: {err}"))?;
        debug!(path, count = certs.len(), "Loaded extra root certificates");

        for cert in certs {
            extra.add(CertificateDer::from(cert));
        }
    }

    ServerCertVerifier::mozilla_with(&extra)
        .map_err(|err| eyre!("Failed to build certificate verifier: {err}"))
}

use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

use attestor_common::SessionConfig;
use attestor_core::signing::KeyPair;
use tokio::sync::Semaphore;

use crate::{
    claim::{ClaimVerifier, TeeBundleVerifier},
    config::AuthProperties,
    tunnel::ConnectOptions,
};

/// Response object of the /info API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    /// Current version of attestor-server
    pub version: String,
    /// Address of the attestor signing key
    pub address: String,
    /// Compressed public key of the attestor signing key, hex encoded
    pub public_key: String,
}

/// Request query of the /ws API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketQuery {
    /// Initial message batch, URL-safe base64 without padding
    pub messages: Option<String>,
}

/// Global data that needs to be shared with the axum handlers
#[derive(Clone)]
pub struct AttestorGlobals {
    pub key: Arc<KeyPair>,
    pub claim_verifier: ClaimVerifier,
    /// Verifier of TEE bundles, `claimTeeBundle` is unsupported without one
    pub tee_verifier: Option<Arc<dyn TeeBundleVerifier>>,
    pub auth_config: AuthProperties,
    pub connect_options: ConnectOptions,
    pub session_config: SessionConfig,
    /// A semaphore to acquire a permit for a client session
    pub semaphore: Arc<Semaphore>,
}

impl AttestorGlobals {
    pub fn new(
        key: Arc<KeyPair>,
        claim_verifier: ClaimVerifier,
        auth_config: AuthProperties,
        connect_options: ConnectOptions,
        request_timeout: Duration,
        semaphore: Arc<Semaphore>,
    ) -> Self {
        Self {
            key,
            claim_verifier,
            tee_verifier: None,
            auth_config,
            connect_options,
            session_config: SessionConfig { request_timeout },
            semaphore,
        }
    }

    /// Sets the verifier used for `claimTeeBundle`.
    pub fn with_tee_verifier(mut self, verifier: Arc<dyn TeeBundleVerifier>) -> Self {
        self.tee_verifier = Some(verifier);
        self
    }
}

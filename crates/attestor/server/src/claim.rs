//! Claim verification: checks a claim against what the attestor observed and
//! signs the result.

use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use attestor_core::{
    claim::{ClaimRequestData, ClaimTranscriptMessage, ProviderClaimData, DEFAULT_EPOCH},
    msg::{
        ClaimResultSignatures, ClaimTeeBundleRequest, ClaimTeeBundleResponse, ClaimTunnelRequest,
        ClaimTunnelResponse, CreateTunnelRequest, TeeBundle,
    },
    signing::{KeyPair, SignatureType},
    ErrorCode, RpcError, Sender, Transcript,
};
use tls_core::{
    reconstruct::{reconstruct, TranscriptRecord},
    ServerCertVerifier, TlsRecord,
};
use tracing::{debug, info, instrument, warn};

use crate::providers::{ClaimReceipt, ProviderRegistry};

/// Verifies the attestations of a [`TeeBundle`] and returns the TLS records
/// they cover.
#[async_trait]
pub trait TeeBundleVerifier: Send + Sync {
    /// Returns the records of `bundle` in transcript order.
    async fn verify(&self, bundle: &TeeBundle) -> Result<Vec<ClaimTranscriptMessage>, RpcError>;
}

/// Verifies claims and signs their results with the attestor key.
#[derive(Clone)]
pub struct ClaimVerifier {
    key: Arc<KeyPair>,
    cert_verifier: Arc<ServerCertVerifier>,
    providers: Arc<ProviderRegistry>,
    max_timestamp_diff_secs: u64,
}

opaque_debug::implement!(ClaimVerifier);

impl ClaimVerifier {
    /// Creates a new verifier.
    pub fn new(
        key: Arc<KeyPair>,
        cert_verifier: Arc<ServerCertVerifier>,
        providers: Arc<ProviderRegistry>,
        max_timestamp_diff_secs: u64,
    ) -> Self {
        Self {
            key,
            cert_verifier,
            providers,
            max_timestamp_diff_secs,
        }
    }

    /// Verifies a claim about a tunnel created with `tunnel` which recorded
    /// `recorded`.
    ///
    /// Verification failures are part of the signed response; only a failure
    /// to sign is returned as an error.
    #[instrument(skip_all, fields(tunnel_id = tunnel.id, provider = %request.data.provider))]
    pub async fn verify_tunnel_claim(
        &self,
        tunnel: &CreateTunnelRequest,
        recorded: &Transcript,
        request: ClaimTunnelRequest,
        now: u64,
    ) -> Result<ClaimTunnelResponse, RpcError> {
        let result = self.check_tunnel_claim(tunnel, recorded, &request, now).await;
        let (claim, error) = split(result);

        let mut response = ClaimTunnelResponse {
            request,
            claim,
            error,
            signatures: None,
        };
        let result_signature = self.key.sign(&response.signing_bytes().map_err(internal)?);
        response.signatures = Some(self.signatures(response.claim.as_ref(), result_signature)?);

        Ok(response)
    }

    /// Verifies a claim backed by a TEE bundle.
    ///
    /// Fails with [`ErrorCode::NotSupported`] if no bundle verifier is
    /// available.
    #[instrument(skip_all, fields(provider = %request.data.provider))]
    pub async fn verify_tee_claim(
        &self,
        bundle_verifier: Option<&dyn TeeBundleVerifier>,
        request: ClaimTeeBundleRequest,
        now: u64,
    ) -> Result<ClaimTeeBundleResponse, RpcError> {
        let bundle_verifier = bundle_verifier
            .ok_or_else(|| RpcError::not_supported("TEE bundles are not supported"))?;

        let result = async {
            let transcript = bundle_verifier.verify(&request.bundle).await?;
            let signing_bytes = request.signing_bytes().map_err(internal)?;
            self.check_claim(
                &request.bundle.request,
                &request.data,
                &signing_bytes,
                &request.signatures.request_signature,
                &transcript,
                now,
            )
            .await
        }
        .await;
        let (claim, error) = split(result);

        let mut response = ClaimTeeBundleResponse {
            claim,
            error,
            signatures: None,
        };
        let result_signature = self.key.sign(&response.signing_bytes().map_err(internal)?);
        response.signatures = Some(self.signatures(response.claim.as_ref(), result_signature)?);

        Ok(response)
    }

    async fn check_tunnel_claim(
        &self,
        tunnel: &CreateTunnelRequest,
        recorded: &Transcript,
        request: &ClaimTunnelRequest,
        now: u64,
    ) -> Result<ProviderClaimData, RpcError> {
        if &request.request != tunnel {
            return Err(RpcError::bad_request("Tunnel request does not match"));
        }

        check_transcript(recorded, &request.transcript)?;

        let signing_bytes = request.signing_bytes().map_err(internal)?;
        self.check_claim(
            tunnel,
            &request.data,
            &signing_bytes,
            &request.signatures.request_signature,
            &request.transcript,
            now,
        )
        .await
    }

    async fn check_claim(
        &self,
        tunnel: &CreateTunnelRequest,
        data: &ClaimRequestData,
        signing_bytes: &[u8],
        owner_signature: &[u8],
        transcript: &[ClaimTranscriptMessage],
        now: u64,
    ) -> Result<ProviderClaimData, RpcError> {
        if now.abs_diff(data.timestamp_s) > self.max_timestamp_diff_secs {
            return Err(RpcError::invalid_claim(format!(
                "Timestamp provided {} is too far off. Current time is {now}",
                data.timestamp_s
            )));
        }

        let owner_signed = SignatureType::default()
            .scheme()
            .verify(signing_bytes, owner_signature, &data.owner)
            .unwrap_or(false);
        if !owner_signed {
            return Err(RpcError::invalid_claim(
                "Claim request signature does not match the owner",
            ));
        }

        let records = transcript
            .iter()
            .map(|msg| {
                Ok(TranscriptRecord {
                    sender: msg.sender,
                    record: TlsRecord::parse(&msg.message)
                        .map_err(|err| RpcError::bad_request(err.to_string()))?,
                    key: msg.reveal.clone(),
                })
            })
            .collect::<Result<Vec<_>, RpcError>>()?;

        let handshake = reconstruct(&records, &self.cert_verifier, now).map_err(|err| {
            let code = if err.is_certificate_error() {
                ErrorCode::CertificateVerificationFailed
            } else {
                ErrorCode::InvalidClaim
            };
            RpcError::new(code, err.to_string())
        })?;
        debug!(
            version = %handshake.version,
            server_name = %handshake.server_name,
            "handshake verified"
        );

        if tunnel.host.parse::<IpAddr>().is_err()
            && !handshake.server_name.eq_ignore_ascii_case(&tunnel.host)
        {
            return Err(RpcError::bad_request(format!(
                "Server name {} does not match tunnel host {}",
                handshake.server_name, tunnel.host
            )));
        }

        let provider = self.providers.get(&data.provider).ok_or_else(|| {
            RpcError::invalid_claim(format!("Unknown provider {}", data.provider))
        })?;
        let receipt = ClaimReceipt {
            request: tunnel,
            handshake: &handshake,
        };
        let validated = provider
            .validate(&receipt, &data.info())
            .await
            .map_err(|err| RpcError::invalid_claim(err.to_string()))?;

        Ok(ProviderClaimData::new(
            validated,
            &data.owner,
            data.timestamp_s,
            DEFAULT_EPOCH,
        ))
    }

    fn signatures(
        &self,
        claim: Option<&ProviderClaimData>,
        result_signature: Result<Vec<u8>, attestor_core::signing::SignatureError>,
    ) -> Result<ClaimResultSignatures, RpcError> {
        let claim_signature = claim
            .map(|claim| self.key.sign(&claim.sign_data()))
            .transpose()
            .map_err(internal)?
            .unwrap_or_default();

        Ok(ClaimResultSignatures {
            attestor_address: self.key.address().to_string(),
            claim_signature,
            result_signature: result_signature.map_err(internal)?,
        })
    }
}

/// Compares the submitted transcript with the one recorded by the attestor.
///
/// Each submitted message must be one TLS record. The byte stream of each
/// sender must match exactly, chunking aside.
fn check_transcript(
    recorded: &Transcript,
    submitted: &[ClaimTranscriptMessage],
) -> Result<(), RpcError> {
    for (index, msg) in submitted.iter().enumerate() {
        TlsRecord::parse(&msg.message).map_err(|err| {
            RpcError::bad_request(format!(
                "Transcript message {index} is not a single TLS record: {err}"
            ))
        })?;
    }

    for sender in [Sender::Client, Sender::Server] {
        let submitted: Vec<u8> = submitted
            .iter()
            .filter(|msg| msg.sender == sender)
            .flat_map(|msg| msg.message.iter().copied())
            .collect();

        if submitted != recorded.concat(sender) {
            warn!(%sender, "submitted transcript does not match recorded transcript");
            return Err(RpcError::bad_request(format!(
                "Transcript does not match the {sender} data seen by the attestor"
            )));
        }
    }

    Ok(())
}

fn split(
    result: Result<ProviderClaimData, RpcError>,
) -> (Option<ProviderClaimData>, Option<RpcError>) {
    match result {
        Ok(claim) => {
            info!(identifier = %claim.identifier, "claim verified");
            (Some(claim), None)
        }
        Err(err) => {
            info!(%err, "claim rejected");
            (None, Some(err))
        }
    }
}

fn internal(err: impl std::fmt::Display) -> RpcError {
    RpcError::internal(err.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use attestor_core::{
        claim::ClaimRequestSignatures,
        signing::{Secp256k1Eth, SignatureScheme},
        RecordKey,
    };
    use tls_core::{CertificateDer, RootCertStore};

    const NOW: u64 = 1_800_000_000;

    /// Records of a TLS 1.3 session with `localhost`, each with its key.
    fn fixture() -> Vec<(Sender, Vec<u8>, Option<RecordKey>)> {
        include_str!("../../../tls/core/src/fixtures/data/localhost/tls13.transcript")
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| {
                let parts: Vec<&str> = line.split_whitespace().collect();
                let sender = if parts[0] == "c" {
                    Sender::Client
                } else {
                    Sender::Server
                };
                let key = (parts.len() == 5).then(|| RecordKey {
                    key: hex::decode(parts[2]).unwrap(),
                    iv: hex::decode(parts[3]).unwrap(),
                    seq: parts[4].parse().unwrap(),
                });
                (sender, hex::decode(parts[1]).unwrap(), key)
            })
            .collect()
    }

    fn verifier() -> ClaimVerifier {
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(
            attestor_server_fixture_certs::CA_CERT_DER.to_vec(),
        ));

        ClaimVerifier::new(
            Arc::new(KeyPair::random(SignatureType::Secp256k1Eth)),
            Arc::new(ServerCertVerifier::new(&roots).unwrap()),
            Arc::new(ProviderRegistry::new()),
            600,
        )
    }

    fn tunnel() -> CreateTunnelRequest {
        CreateTunnelRequest {
            id: 1,
            host: "localhost".to_string(),
            port: 4443,
            geo_location: None,
        }
    }

    fn recorded() -> Transcript {
        let mut transcript = Transcript::new();
        for (sender, record, _) in fixture() {
            transcript.push(sender, record);
        }
        transcript
    }

    fn claim_request(owner: &KeyPair, parameters: &str) -> ClaimTunnelRequest {
        let mut request = ClaimTunnelRequest {
            request: tunnel(),
            data: ClaimRequestData {
                provider: "http".to_string(),
                parameters: parameters.to_string(),
                owner: owner.address().to_string(),
                timestamp_s: NOW,
                context: String::new(),
            },
            transcript: fixture()
                .into_iter()
                .map(|(sender, message, reveal)| ClaimTranscriptMessage {
                    sender,
                    message,
                    reveal,
                })
                .collect(),
            signatures: ClaimRequestSignatures::default(),
        };
        sign(&mut request, owner);
        request
    }

    fn sign(request: &mut ClaimTunnelRequest, owner: &KeyPair) {
        request.signatures.request_signature =
            owner.sign(&request.signing_bytes().unwrap()).unwrap();
    }

    const PARAMS: &str =
        r#"{"url":"https://localhost/","responseMatches":[{"type":"contains","value":"hello"}]}"#;

    #[tokio::test]
    async fn test_valid_claim() {
        let verifier = verifier();
        let owner = KeyPair::random(SignatureType::Secp256k1Eth);
        let request = claim_request(&owner, PARAMS);

        let response = verifier
            .verify_tunnel_claim(&tunnel(), &recorded(), request, NOW)
            .await
            .unwrap();

        assert_eq!(response.error, None);
        let claim = response.claim.clone().unwrap();
        assert_eq!(claim.owner, owner.address());
        assert_eq!(claim.epoch, DEFAULT_EPOCH);

        let signatures = response.signatures.clone().unwrap();
        assert_eq!(signatures.attestor_address, verifier.key.address());
        assert!(Secp256k1Eth
            .verify(
                &claim.sign_data(),
                &signatures.claim_signature,
                &signatures.attestor_address
            )
            .unwrap());
        assert!(Secp256k1Eth
            .verify(
                &response.signing_bytes().unwrap(),
                &signatures.result_signature,
                &signatures.attestor_address
            )
            .unwrap());
    }

    #[tokio::test]
    async fn test_tunnel_mismatch() {
        let owner = KeyPair::random(SignatureType::Secp256k1Eth);
        let mut request = claim_request(&owner, PARAMS);
        request.request.host = "example.com".to_string();
        sign(&mut request, &owner);

        let response = verifier()
            .verify_tunnel_claim(&tunnel(), &recorded(), request, NOW)
            .await
            .unwrap();

        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorCode::BadRequest);
        assert_eq!(error.message, "Tunnel request does not match");
        assert!(response.claim.is_none());
        assert!(response.signatures.unwrap().claim_signature.is_empty());
    }

    #[tokio::test]
    async fn test_transcript_byte_flipped() {
        let owner = KeyPair::random(SignatureType::Secp256k1Eth);
        let mut request = claim_request(&owner, PARAMS);
        let last = request.transcript.last_mut().unwrap();
        let byte = last.message.len() - 1;
        last.message[byte] ^= 1;
        sign(&mut request, &owner);

        let response = verifier()
            .verify_tunnel_claim(&tunnel(), &recorded(), request, NOW)
            .await
            .unwrap();

        assert_eq!(response.error.unwrap().code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_stale_timestamp() {
        let owner = KeyPair::random(SignatureType::Secp256k1Eth);
        let mut request = claim_request(&owner, PARAMS);
        request.data.timestamp_s = NOW - 601;
        sign(&mut request, &owner);

        let response = verifier()
            .verify_tunnel_claim(&tunnel(), &recorded(), request, NOW)
            .await
            .unwrap();

        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidClaim);
    }

    #[tokio::test]
    async fn test_wrong_owner_signature() {
        let owner = KeyPair::random(SignatureType::Secp256k1Eth);
        let mut request = claim_request(&owner, PARAMS);
        sign(&mut request, &KeyPair::random(SignatureType::Secp256k1Eth));

        let response = verifier()
            .verify_tunnel_claim(&tunnel(), &recorded(), request, NOW)
            .await
            .unwrap();

        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidClaim);
    }

    #[tokio::test]
    async fn test_untrusted_certificate() {
        let owner = KeyPair::random(SignatureType::Secp256k1Eth);
        let request = claim_request(&owner, PARAMS);
        let verifier = ClaimVerifier {
            cert_verifier: Arc::new(ServerCertVerifier::mozilla()),
            ..verifier()
        };

        let response = verifier
            .verify_tunnel_claim(&tunnel(), &recorded(), request, NOW)
            .await
            .unwrap();

        assert_eq!(
            response.error.unwrap().code,
            ErrorCode::CertificateVerificationFailed
        );
    }

    #[tokio::test]
    async fn test_provider_rejects() {
        let owner = KeyPair::random(SignatureType::Secp256k1Eth);
        let request = claim_request(
            &owner,
            r#"{"url":"https://localhost/","responseMatches":[{"type":"contains","value":"goodbye"}]}"#,
        );

        let response = verifier()
            .verify_tunnel_claim(&tunnel(), &recorded(), request, NOW)
            .await
            .unwrap();

        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidClaim);
    }

    #[tokio::test]
    async fn test_tee_without_verifier() {
        let owner = KeyPair::random(SignatureType::Secp256k1Eth);
        let request = ClaimTeeBundleRequest {
            bundle: TeeBundle {
                request: tunnel(),
                transcript: Vec::new(),
                attestations: Vec::new(),
            },
            data: claim_request(&owner, PARAMS).data,
            signatures: ClaimRequestSignatures::default(),
        };

        let err = verifier()
            .verify_tee_claim(None, request, NOW)
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::NotSupported);
    }

    struct FixtureBundles;

    #[async_trait]
    impl TeeBundleVerifier for FixtureBundles {
        async fn verify(
            &self,
            _bundle: &TeeBundle,
        ) -> Result<Vec<ClaimTranscriptMessage>, RpcError> {
            Ok(fixture()
                .into_iter()
                .map(|(sender, message, reveal)| ClaimTranscriptMessage {
                    sender,
                    message,
                    reveal,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_tee_claim() {
        let owner = KeyPair::random(SignatureType::Secp256k1Eth);
        let mut request = ClaimTeeBundleRequest {
            bundle: TeeBundle {
                request: tunnel(),
                transcript: b"attested".to_vec(),
                attestations: vec![b"quote".to_vec()],
            },
            data: claim_request(&owner, PARAMS).data,
            signatures: ClaimRequestSignatures::default(),
        };
        request.signatures.request_signature =
            owner.sign(&request.signing_bytes().unwrap()).unwrap();

        let response = verifier()
            .verify_tee_claim(Some(&FixtureBundles as &dyn TeeBundleVerifier), request, NOW)
            .await
            .unwrap();

        assert_eq!(response.error, None);
        assert!(response.claim.is_some());
    }
}

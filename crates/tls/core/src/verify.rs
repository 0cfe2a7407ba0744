//! Server certificate and handshake signature verification.

use std::time::Duration;

pub use rustls_pki_types::CertificateDer;
use rustls_pki_types::{self as webpki_types, ServerName, SignatureVerificationAlgorithm};

use crate::enums::{SignatureScheme, TlsVersion};

/// Root certificate store.
///
/// This stores root certificates which are used to verify end-entity
/// certificates presented by a TLS server.
#[derive(Debug, Clone, Default)]
pub struct RootCertStore {
    /// Unvalidated DER-encoded X.509 root certificates.
    pub roots: Vec<CertificateDer<'static>>,
}

impl RootCertStore {
    /// Creates an empty root certificate store.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adds a DER-encoded root certificate.
    pub fn add(&mut self, cert: CertificateDer<'static>) {
        self.roots.push(cert);
    }
}

/// Server certificate verifier.
#[derive(Debug, Clone)]
pub struct ServerCertVerifier {
    roots: Vec<webpki_types::TrustAnchor<'static>>,
}

impl ServerCertVerifier {
    /// Creates a new server certificate verifier which trusts only `roots`.
    pub fn new(roots: &RootCertStore) -> Result<Self, ServerCertVerifierError> {
        Ok(Self {
            roots: trust_anchors(roots)?,
        })
    }

    /// Creates a new server certificate verifier with Mozilla root
    /// certificates.
    pub fn mozilla() -> Self {
        Self {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        }
    }

    /// Creates a verifier trusting the Mozilla roots plus `extra`.
    pub fn mozilla_with(extra: &RootCertStore) -> Result<Self, ServerCertVerifierError> {
        let mut verifier = Self::mozilla();
        verifier.roots.extend(trust_anchors(extra)?);
        Ok(verifier)
    }

    /// Verifies the server certificate was valid at the given time of
    /// presentation.
    ///
    /// # Arguments
    ///
    /// * `end_entity` - End-entity certificate to verify.
    /// * `intermediates` - Intermediate certificates to a trust anchor.
    /// * `server_name` - Server DNS name or IP address.
    /// * `time` - Unix time the certificate was presented.
    pub fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &str,
        time: u64,
    ) -> Result<(), ServerCertVerifierError> {
        let cert = end_entity_cert(end_entity)?;
        let server_name = ServerName::try_from(server_name)
            .map_err(|_| ServerCertVerifierError::InvalidServerName)?;
        let time = webpki_types::UnixTime::since_unix_epoch(Duration::from_secs(time));

        cert.verify_for_usage(
            webpki::ALL_VERIFICATION_ALGS,
            &self.roots,
            intermediates,
            time,
            webpki::KeyUsage::server_auth(),
            None,
            None,
        )
        .map(|_| ())
        .map_err(|e| ServerCertVerifierError::InvalidPath {
            reason: e.to_string(),
        })?;

        cert.verify_is_valid_for_subject_name(&server_name)
            .map_err(|_| ServerCertVerifierError::InvalidServerName)?;

        Ok(())
    }
}

fn trust_anchors(
    store: &RootCertStore,
) -> Result<Vec<webpki_types::TrustAnchor<'static>>, ServerCertVerifierError> {
    store
        .roots
        .iter()
        .map(|cert| {
            webpki::anchor_from_trusted_cert(cert)
                .map(|anchor| anchor.to_owned())
                .map_err(|err| ServerCertVerifierError::InvalidRootCertificate {
                    cert: cert.clone(),
                    reason: err.to_string(),
                })
        })
        .collect()
}

fn end_entity_cert<'a>(
    cert: &'a CertificateDer<'a>,
) -> Result<webpki::EndEntityCert<'a>, ServerCertVerifierError> {
    webpki::EndEntityCert::try_from(cert).map_err(|e| {
        ServerCertVerifierError::InvalidEndEntityCertificate {
            cert: cert.clone().into_owned(),
            reason: e.to_string(),
        }
    })
}

/// Context string of the server's TLS 1.3 CertificateVerify.
const TLS13_SERVER_CONTEXT: &[u8] = b"TLS 1.3, server CertificateVerify";

/// Builds the content covered by a TLS 1.3 server CertificateVerify.
pub fn tls13_signed_message(transcript_hash: &[u8]) -> Vec<u8> {
    let mut message = vec![0x20u8; 64];
    message.extend_from_slice(TLS13_SERVER_CONTEXT);
    message.push(0);
    message.extend_from_slice(transcript_hash);
    message
}

/// Builds the content covered by a TLS 1.2 ECDHE ServerKeyExchange.
pub fn tls12_signed_message(
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    params: &[u8],
) -> Vec<u8> {
    let mut message = Vec::with_capacity(64 + params.len());
    message.extend_from_slice(client_random);
    message.extend_from_slice(server_random);
    message.extend_from_slice(params);
    message
}

/// Verifies a handshake signature made by the key of `end_entity`.
pub fn verify_signature(
    version: TlsVersion,
    end_entity: &CertificateDer<'_>,
    scheme: SignatureScheme,
    message: &[u8],
    signature: &[u8],
) -> Result<(), ServerCertVerifierError> {
    let cert = end_entity_cert(end_entity)?;
    let algs = signature_algorithms(version, scheme)?;

    if algs
        .iter()
        .any(|alg| cert.verify_signature(*alg, message, signature).is_ok())
    {
        Ok(())
    } else {
        Err(ServerCertVerifierError::InvalidSignature)
    }
}

fn signature_algorithms(
    version: TlsVersion,
    scheme: SignatureScheme,
) -> Result<Vec<&'static dyn SignatureVerificationAlgorithm>, ServerCertVerifierError> {
    use webpki::ring as alg;

    // TLS 1.2 ECDSA schemes do not bind the curve, TLS 1.3 does.
    Ok(match (version, scheme) {
        (TlsVersion::V1_2, SignatureScheme::ECDSA_NISTP256_SHA256) => {
            vec![alg::ECDSA_P256_SHA256, alg::ECDSA_P384_SHA256]
        }
        (TlsVersion::V1_2, SignatureScheme::ECDSA_NISTP384_SHA384) => {
            vec![alg::ECDSA_P384_SHA384, alg::ECDSA_P256_SHA384]
        }
        (TlsVersion::V1_3, SignatureScheme::ECDSA_NISTP256_SHA256) => vec![alg::ECDSA_P256_SHA256],
        (TlsVersion::V1_3, SignatureScheme::ECDSA_NISTP384_SHA384) => vec![alg::ECDSA_P384_SHA384],
        (TlsVersion::V1_2, SignatureScheme::RSA_PKCS1_SHA256) => {
            vec![alg::RSA_PKCS1_2048_8192_SHA256]
        }
        (TlsVersion::V1_2, SignatureScheme::RSA_PKCS1_SHA384) => {
            vec![alg::RSA_PKCS1_2048_8192_SHA384]
        }
        (TlsVersion::V1_2, SignatureScheme::RSA_PKCS1_SHA512) => {
            vec![alg::RSA_PKCS1_2048_8192_SHA512]
        }
        (_, SignatureScheme::RSA_PSS_SHA256) => vec![alg::RSA_PSS_2048_8192_SHA256_LEGACY_KEY],
        (_, SignatureScheme::RSA_PSS_SHA384) => vec![alg::RSA_PSS_2048_8192_SHA384_LEGACY_KEY],
        (_, SignatureScheme::RSA_PSS_SHA512) => vec![alg::RSA_PSS_2048_8192_SHA512_LEGACY_KEY],
        (_, SignatureScheme::ED25519) => vec![alg::ED25519],
        _ => return Err(ServerCertVerifierError::UnsupportedSignatureScheme(scheme)),
    })
}

/// Error for [`ServerCertVerifier`].
#[derive(Debug, thiserror::Error)]
pub enum ServerCertVerifierError {
    /// Root certificate store contains invalid certificate.
    #[error("root certificate store contains invalid certificate: {reason}")]
    InvalidRootCertificate {
        /// Invalid certificate.
        cert: CertificateDer<'static>,
        /// Reason for invalidity.
        reason: String,
    },
    /// End-entity certificate is invalid.
    #[error("end-entity certificate is invalid: {reason}")]
    InvalidEndEntityCertificate {
        /// Invalid certificate.
        cert: CertificateDer<'static>,
        /// Reason for invalidity.
        reason: String,
    },
    /// Failed to verify certificate path to provided trust anchors.
    #[error("failed to verify certificate path to provided trust anchors: {reason}")]
    InvalidPath {
        /// Reason for the failure.
        reason: String,
    },
    /// Failed to verify certificate is valid for provided server name.
    #[error("failed to verify certificate is valid for provided server name")]
    InvalidServerName,
    /// The handshake used a signature scheme which is not supported.
    #[error("unsupported signature scheme: {0:?}")]
    UnsupportedSignatureScheme(SignatureScheme),
    /// The handshake signature did not verify.
    #[error("handshake signature is invalid")]
    InvalidSignature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls13_signed_message_layout() {
        let message = tls13_signed_message(&[0xab; 32]);

        assert_eq!(&message[..64], &[0x20u8; 64]);
        assert_eq!(&message[64..97], TLS13_SERVER_CONTEXT);
        assert_eq!(message[97], 0);
        assert_eq!(&message[98..], &[0xab; 32]);
    }

    #[test]
    fn test_tls12_signed_message_layout() {
        let message = tls12_signed_message(&[1; 32], &[2; 32], &[3, 4]);
        assert_eq!(message.len(), 66);
        assert_eq!(&message[64..], &[3, 4]);
    }

    #[test]
    fn test_tls13_rejects_pkcs1() {
        assert!(matches!(
            signature_algorithms(TlsVersion::V1_3, SignatureScheme::RSA_PKCS1_SHA256),
            Err(ServerCertVerifierError::UnsupportedSignatureScheme(_))
        ));
    }

    #[test]
    fn test_invalid_end_entity() {
        let verifier = ServerCertVerifier::mozilla();
        let err = verifier
            .verify_server_cert(&CertificateDer::from(vec![1, 2, 3]), &[], "example.com", 0)
            .unwrap_err();

        assert!(matches!(
            err,
            ServerCertVerifierError::InvalidEndEntityCertificate { .. }
        ));
    }

    #[test]
    fn test_invalid_root_certificate() {
        let mut store = RootCertStore::empty();
        store.add(CertificateDer::from(vec![0u8; 4]));

        assert!(matches!(
            ServerCertVerifier::new(&store),
            Err(ServerCertVerifierError::InvalidRootCertificate { .. })
        ));
    }
}

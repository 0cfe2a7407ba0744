//! Authentication tokens presented at initialisation.

use serde::{Deserialize, Serialize};

use crate::{
    codec::{to_bytes, CodecError},
    signing::{KeyPair, Secp256k1Eth, SignatureError},
};

/// The user an authentication token was issued to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthenticatedUserData {
    /// User id.
    pub id: String,
    /// Hosts the user may open tunnels to. Empty allows any host.
    pub host_whitelist: Vec<String>,
    /// Unix time the token was issued at.
    pub created_at: u64,
    /// Unix time the token expires at.
    pub expires_at: u64,
}

impl AuthenticatedUserData {
    /// Returns `true` if the user may open a tunnel to `host`.
    pub fn allows_host(&self, host: &str) -> bool {
        self.host_whitelist.is_empty()
            || self
                .host_whitelist
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(host))
    }
}

/// A signed authentication token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationRequest {
    /// The authenticated user.
    pub data: AuthenticatedUserData,
    /// Issuer signature over the encoded `data`.
    pub signature: Vec<u8>,
}

impl AuthenticationRequest {
    /// Issues a token for `data`.
    pub fn sign(data: AuthenticatedUserData, issuer: &KeyPair) -> Result<Self, AuthError> {
        let signature = issuer.sign(&to_bytes(&data)?)?;
        Ok(Self { data, signature })
    }

    /// Verifies the token was issued by one of `issuers` and has not expired
    /// at `now`.
    pub fn verify(&self, issuers: &[String], now: u64) -> Result<&AuthenticatedUserData, AuthError> {
        if self.data.expires_at <= now {
            return Err(AuthError::Expired);
        }

        let issuer = Secp256k1Eth::recover_address(&to_bytes(&self.data)?, &self.signature)?;
        if !issuers
            .iter()
            .any(|trusted| trusted.eq_ignore_ascii_case(&issuer))
        {
            return Err(AuthError::UntrustedIssuer(issuer));
        }

        Ok(&self.data)
    }
}

/// Error for authentication tokens.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The token has expired.
    #[error("authentication token has expired")]
    Expired,
    /// The token was signed by an unknown issuer.
    #[error("authentication token issued by untrusted issuer {0}")]
    UntrustedIssuer(String),
    /// The signature is malformed.
    #[error(transparent)]
    Signature(#[from] SignatureError),
    /// The token could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::SignatureType;

    fn user(expires_at: u64) -> AuthenticatedUserData {
        AuthenticatedUserData {
            id: "user-1".to_string(),
            host_whitelist: vec!["example.com".to_string()],
            created_at: 100,
            expires_at,
        }
    }

    #[test]
    fn test_verify_trusted_issuer() {
        let issuer = KeyPair::random(SignatureType::Secp256k1Eth);
        let token = AuthenticationRequest::sign(user(1_000), &issuer).unwrap();

        let data = token.verify(&[issuer.address().to_string()], 500).unwrap();
        assert!(data.allows_host("EXAMPLE.com"));
        assert!(!data.allows_host("other.com"));
    }

    #[test]
    fn test_verify_untrusted_issuer() {
        let issuer = KeyPair::random(SignatureType::Secp256k1Eth);
        let other = KeyPair::random(SignatureType::Secp256k1Eth);
        let token = AuthenticationRequest::sign(user(1_000), &issuer).unwrap();

        assert!(matches!(
            token.verify(&[other.address().to_string()], 500),
            Err(AuthError::UntrustedIssuer(_))
        ));
    }

    #[test]
    fn test_verify_tampered_data() {
        let issuer = KeyPair::random(SignatureType::Secp256k1Eth);
        let mut token = AuthenticationRequest::sign(user(1_000), &issuer).unwrap();
        token.data.host_whitelist.clear();

        assert!(token.verify(&[issuer.address().to_string()], 500).is_err());
    }

    #[test]
    fn test_verify_expired() {
        let issuer = KeyPair::random(SignatureType::Secp256k1Eth);
        let token = AuthenticationRequest::sign(user(1_000), &issuer).unwrap();

        assert!(matches!(
            token.verify(&[issuer.address().to_string()], 1_000),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn test_empty_whitelist_allows_any_host() {
        assert!(AuthenticatedUserData::default().allows_host("anything"));
    }
}

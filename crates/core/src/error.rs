//! Errors carried on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error codes of the attestor protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Not an error. Terminates a connection gracefully.
    NoError,
    /// Unexpected failure on the remote side.
    InternalError,
    /// The connection or a tunnel socket failed.
    NetworkError,
    /// A request did not complete in time.
    Timeout,
    /// The request is malformed or contradicts what the attestor observed.
    BadRequest,
    /// The referenced resource does not exist.
    NotFound,
    /// The claim could not be verified.
    InvalidClaim,
    /// Authentication was missing or invalid.
    AuthenticationFailed,
    /// The server's certificate chain or handshake signature is invalid.
    CertificateVerificationFailed,
    /// The geolocation proxy failed.
    ProxyError,
    /// Payment for the claim was refused.
    PaymentRefused,
    /// The request is not supported by this attestor.
    NotSupported,
}

impl ErrorCode {
    /// Returns the name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "ERROR_NO_ERROR",
            ErrorCode::InternalError => "ERROR_INTERNAL",
            ErrorCode::NetworkError => "ERROR_NETWORK_ERROR",
            ErrorCode::Timeout => "ERROR_TIMEOUT",
            ErrorCode::BadRequest => "ERROR_BAD_REQUEST",
            ErrorCode::NotFound => "ERROR_NOT_FOUND",
            ErrorCode::InvalidClaim => "ERROR_INVALID_CLAIM",
            ErrorCode::AuthenticationFailed => "ERROR_AUTHENTICATION_FAILED",
            ErrorCode::CertificateVerificationFailed => "ERROR_CERTIFICATE_VERIFICATION_FAILED",
            ErrorCode::ProxyError => "ERROR_PROXY_ERROR",
            ErrorCode::PaymentRefused => "ERROR_PAYMENT_REFUSED",
            ErrorCode::NotSupported => "ERROR_NOT_SUPPORTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error as sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    /// Error code.
    pub code: ErrorCode,
    /// Human readable description.
    pub message: String,
    /// Optional JSON encoded details.
    pub data: Option<String>,
}

impl RpcError {
    /// Creates a new error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches JSON encoded details.
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// The error used to signal a graceful shutdown.
    pub fn no_error() -> Self {
        Self::new(ErrorCode::NoError, "connection closed")
    }

    /// Returns `true` if this error only signals a graceful shutdown.
    pub fn is_no_error(&self) -> bool {
        self.code == ErrorCode::NoError
    }

    #[allow(missing_docs)]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    #[allow(missing_docs)]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message)
    }

    #[allow(missing_docs)]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    #[allow(missing_docs)]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    #[allow(missing_docs)]
    pub fn invalid_claim(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidClaim, message)
    }

    #[allow(missing_docs)]
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotSupported, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = RpcError::bad_request("Client already initialised");
        assert_eq!(
            err.to_string(),
            "ERROR_BAD_REQUEST: Client already initialised"
        );
    }

    #[test]
    fn test_no_error() {
        assert!(RpcError::no_error().is_no_error());
        assert!(!RpcError::network("closed").is_no_error());
    }
}

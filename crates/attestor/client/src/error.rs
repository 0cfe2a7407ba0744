//! Attestor client errors.
//!
//! This module handles errors that might occur while connecting to an
//! attestor, relaying tunnel data and submitting claims.

use attestor_core::RpcError;
use derive_builder::UninitializedFieldError;
use std::{error::Error, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ErrorKind {
    Internal,
    Builder,
    Connection,
    Rpc,
    Tunnel,
    Tls,
    Claim,
}

#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub struct ClientError {
    kind: ErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl ClientError {
    pub(crate) fn new(kind: ErrorKind, source: Option<Box<dyn Error + Send + Sync>>) -> Self {
        Self { kind, source }
    }

    pub(crate) fn msg(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self::new(kind, Some(msg.into().into()))
    }

    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error sent by the attestor, if this is one.
    pub fn rpc_error(&self) -> Option<&RpcError> {
        self.source.as_ref()?.downcast_ref::<RpcError>()
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "client error: {:?}, source: {:?}",
            self.kind, self.source
        )
    }
}

impl From<UninitializedFieldError> for ClientError {
    fn from(ufe: UninitializedFieldError) -> Self {
        ClientError::new(ErrorKind::Builder, Some(Box::new(ufe)))
    }
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        ClientError::new(ErrorKind::Rpc, Some(Box::new(err)))
    }
}

impl From<rustls::Error> for ClientError {
    fn from(err: rustls::Error) -> Self {
        ClientError::new(ErrorKind::Tls, Some(Box::new(err)))
    }
}

//! TLS primitives used by the attestor.
//!
//! This crate does not implement a TLS client or server. It understands a TLS
//! byte stream that was captured elsewhere: it splits the stream into records,
//! decrypts the records whose keys were revealed, replays the handshake and
//! verifies the server's certificate chain and handshake signature.
//!
//! The entry point for verification is the [`HandshakeReconstructor`].

#![deny(missing_docs, unreachable_pub, unused_must_use)]
#![deny(clippy::all)]
#![forbid(unsafe_code)]

pub mod cipher;
pub mod codec;
pub mod enums;
pub mod handshake;
pub mod key_schedule;
pub mod reconstruct;
pub mod record;
pub mod suites;
pub mod verify;

#[cfg(test)]
mod fixtures;

pub use cipher::{DecryptError, RecordKey};
pub use enums::{CipherSuite, ContentType, HandshakeType, SignatureScheme, TlsVersion};
pub use reconstruct::{
    reconstruct, ApplicationRecord, HandshakeError, HandshakeReconstructor, HandshakeSummary,
    TranscriptRecord,
};
pub use record::{RecordError, RecordSplitter, Sender, TlsRecord};
pub use verify::{CertificateDer, RootCertStore, ServerCertVerifier, ServerCertVerifierError};

//! Attestor core protocol library.
//!
//! This crate contains the types exchanged between an attestor and its
//! clients: the RPC message envelope and its codec, tunnel transcripts,
//! claims with their canonical encoding, and the signature scheme used to
//! sign them.

#![deny(missing_docs, unreachable_pub, unused_must_use)]
#![deny(clippy::all)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod claim;
pub mod codec;
pub mod error;
pub mod geo;
pub mod msg;
pub mod signing;
pub mod transcript;

pub use error::{ErrorCode, RpcError};
pub use msg::{Payload, RpcMessage, RpcRequest, RpcResponse, RpcType};
pub use tls_core::{RecordKey, Sender};
pub use transcript::{Transcript, TranscriptEntry};

/// Version of the protocol spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 4;

/// Returns the current time in seconds since the Unix epoch.
pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

//! Client of the attestor.
//!
//! An [`AttestorClient`] holds a session with an attestor. Over it, a
//! [`TlsTunnel`] connects to a target server through the attestor, which
//! relays and records the encrypted bytes. Afterwards [`claim_tunnel`]
//! reveals the record keys selected by a [`RevealPolicy`] and asks the
//! attestor to sign a claim about the connection.

#![deny(missing_docs, unreachable_pub, unused_must_use)]
#![deny(clippy::all)]
#![forbid(unsafe_code)]

mod claim;
mod client;
mod error;
mod pool;
mod reveal;
mod tls;
mod tunnel;

pub use claim::{claim_tee_bundle, claim_tunnel};
pub use client::{AttestorClient, AttestorClientConfig, AttestorClientConfigBuilder};
pub use error::{ClientError, ErrorKind};
pub use pool::ClientPool;
pub use reveal::{reveal_records, RevealError, RevealPolicy, SecretLog};
pub use tls::{default_root_store, TlsTunnel, TlsTunnelConfig, TlsTunnelConfigBuilder};
pub use tunnel::{RpcTunnel, TunnelHandlers};

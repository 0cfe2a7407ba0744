//! RPC session shared between the attestor and its clients.
//!
//! A [`Session`] runs over one duplex frame transport. It correlates
//! requests with responses, enforces the initialisation handshake and
//! publishes everything else it receives as [`Event`]s.

#![deny(missing_docs, unreachable_pub, unused_must_use)]
#![deny(clippy::all)]
#![forbid(unsafe_code)]

pub mod event;
pub mod session;
pub mod transport;

pub use event::{Event, EventKind, EventRegistry, SubscriptionId};
pub use session::{IncomingRequest, Session, SessionConfig, SessionMetadata};
pub use transport::{FrameSink, FrameStream, TransportError};

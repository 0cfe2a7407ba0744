//! Attestor server: relays client tunnels to their targets and signs claims
//! verified against what it relayed.

mod auth;
pub mod claim;
mod cli;
mod config;
mod error;
pub mod providers;
pub mod proxy;
mod server;
mod server_tracing;
mod service;
mod session;
mod signing;
pub mod tunnel;
mod types;
mod util;

pub use cli::CliFields;
pub use config::{
    AttestationProperties, AttestorServerProperties, AuthProperties, ConcurrencyProperties,
    LogFormat, LogProperties, ProxyProperties, ServerProperties,
};
pub use error::AttestorServerError;
pub use server::{run_server, serve};
pub use server_tracing::init_tracing;
pub use signing::{key_from_pkcs8_pem, public_key_hex};
pub use types::InfoResponse;
pub use util::parse_config_file;

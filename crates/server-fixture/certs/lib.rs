//! Certificate fixtures for testing.
//!
//! The root CA and the server certificate are valid from 2024-01-01 until
//! 2124-01-01. The server certificate is issued for `localhost`.

#![deny(missing_docs, unreachable_pub, unused_must_use)]
#![deny(clippy::all)]
#![forbid(unsafe_code)]

/// A certificate authority certificate fixture.
pub static CA_CERT_DER: &[u8] = include_bytes!("root_ca_cert.der");
/// The certificate authority certificate, PEM encoded.
pub static CA_CERT_PEM: &str = include_str!("root_ca_cert.pem");
/// A server certificate (domain=localhost) fixture.
pub static SERVER_CERT_DER: &[u8] = include_bytes!("server_cert.der");
/// A server private key fixture, PKCS#8 DER encoded.
pub static SERVER_KEY_DER: &[u8] = include_bytes!("server_private_key.der");
/// The domain name bound to the server certificate.
pub static SERVER_DOMAIN: &str = "localhost";

/// Returns the path of the PEM encoded certificate authority certificate.
pub fn ca_cert_pem_path() -> &'static str {
    concat!(env!("CARGO_MANIFEST_DIR"), "/root_ca_cert.pem")
}

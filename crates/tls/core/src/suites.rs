//! Cipher suite parameters.

use ring::{aead, digest, hkdf};

use crate::enums::{CipherSuite, TlsVersion};

/// Bulk encryption algorithm of a cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadAlgorithm {
    /// AES-128-GCM.
    Aes128Gcm,
    /// AES-256-GCM.
    Aes256Gcm,
    /// ChaCha20-Poly1305.
    Chacha20Poly1305,
}

impl AeadAlgorithm {
    pub(crate) fn ring(self) -> &'static aead::Algorithm {
        match self {
            AeadAlgorithm::Aes128Gcm => &aead::AES_128_GCM,
            AeadAlgorithm::Aes256Gcm => &aead::AES_256_GCM,
            AeadAlgorithm::Chacha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    /// Length of the traffic key in bytes.
    pub fn key_len(self) -> usize {
        self.ring().key_len()
    }

    /// Length of the TLS 1.2 implicit IV.
    ///
    /// GCM suites carry an 8 byte explicit nonce in each record, the rest of the
    /// nonce is the 4 byte salt from the key block.
    pub fn tls12_fixed_iv_len(self) -> usize {
        match self {
            AeadAlgorithm::Aes128Gcm | AeadAlgorithm::Aes256Gcm => 4,
            AeadAlgorithm::Chacha20Poly1305 => aead::NONCE_LEN,
        }
    }

    /// Length of the explicit nonce prefixed to each TLS 1.2 record.
    pub fn tls12_explicit_nonce_len(self) -> usize {
        match self {
            AeadAlgorithm::Aes128Gcm | AeadAlgorithm::Aes256Gcm => 8,
            AeadAlgorithm::Chacha20Poly1305 => 0,
        }
    }
}

/// Hash algorithm of a cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256.
    Sha256,
    /// SHA-384.
    Sha384,
}

impl HashAlgorithm {
    /// Output length of the hash in bytes.
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }

    /// Hashes `data`.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        digest::digest(self.ring_digest(), data).as_ref().to_vec()
    }

    pub(crate) fn ring_digest(self) -> &'static digest::Algorithm {
        match self {
            HashAlgorithm::Sha256 => &digest::SHA256,
            HashAlgorithm::Sha384 => &digest::SHA384,
        }
    }

    pub(crate) fn hkdf(self) -> hkdf::Algorithm {
        match self {
            HashAlgorithm::Sha256 => hkdf::HKDF_SHA256,
            HashAlgorithm::Sha384 => hkdf::HKDF_SHA384,
        }
    }
}

/// Parameters of a supported cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuiteParams {
    /// The suite identifier.
    pub suite: CipherSuite,
    /// The protocol version the suite belongs to.
    pub version: TlsVersion,
    /// Record protection algorithm.
    pub aead: AeadAlgorithm,
    /// Hash used for the key schedule and transcript.
    pub hash: HashAlgorithm,
}

impl SuiteParams {
    /// Looks up the parameters of `suite`, returns `None` if unsupported.
    pub fn lookup(suite: CipherSuite) -> Option<Self> {
        use AeadAlgorithm::*;
        use HashAlgorithm::*;

        let (version, aead, hash) = match suite {
            CipherSuite::TLS13_AES_128_GCM_SHA256 => (TlsVersion::V1_3, Aes128Gcm, Sha256),
            CipherSuite::TLS13_AES_256_GCM_SHA384 => (TlsVersion::V1_3, Aes256Gcm, Sha384),
            CipherSuite::TLS13_CHACHA20_POLY1305_SHA256 => {
                (TlsVersion::V1_3, Chacha20Poly1305, Sha256)
            }
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
            | CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 => {
                (TlsVersion::V1_2, Aes128Gcm, Sha256)
            }
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
            | CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => {
                (TlsVersion::V1_2, Aes256Gcm, Sha384)
            }
            CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
            | CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => {
                (TlsVersion::V1_2, Chacha20Poly1305, Sha256)
            }
            _ => return None,
        };

        Some(Self {
            suite,
            version,
            aead,
            hash,
        })
    }
}

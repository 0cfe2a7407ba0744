//! TLS protocol identifiers.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Record layer content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    /// change_cipher_spec(20)
    ChangeCipherSpec = 20,
    /// alert(21)
    Alert = 21,
    /// handshake(22)
    Handshake = 22,
    /// application_data(23)
    ApplicationData = 23,
}

impl ContentType {
    /// Parses a content type byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            20 => Self::ChangeCipherSpec,
            21 => Self::Alert,
            22 => Self::Handshake,
            23 => Self::ApplicationData,
            _ => return None,
        })
    }

    /// Returns the wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Handshake message type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandshakeType(pub u8);

#[allow(missing_docs)]
impl HandshakeType {
    pub const CLIENT_HELLO: Self = Self(1);
    pub const SERVER_HELLO: Self = Self(2);
    pub const NEW_SESSION_TICKET: Self = Self(4);
    pub const END_OF_EARLY_DATA: Self = Self(5);
    pub const ENCRYPTED_EXTENSIONS: Self = Self(8);
    pub const CERTIFICATE: Self = Self(11);
    pub const SERVER_KEY_EXCHANGE: Self = Self(12);
    pub const CERTIFICATE_REQUEST: Self = Self(13);
    pub const SERVER_HELLO_DONE: Self = Self(14);
    pub const CERTIFICATE_VERIFY: Self = Self(15);
    pub const CLIENT_KEY_EXCHANGE: Self = Self(16);
    pub const FINISHED: Self = Self(20);
    pub const CERTIFICATE_STATUS: Self = Self(22);
    pub const KEY_UPDATE: Self = Self(24);
    pub const MESSAGE_HASH: Self = Self(254);
}

impl fmt::Debug for HandshakeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::CLIENT_HELLO => "ClientHello",
            Self::SERVER_HELLO => "ServerHello",
            Self::NEW_SESSION_TICKET => "NewSessionTicket",
            Self::END_OF_EARLY_DATA => "EndOfEarlyData",
            Self::ENCRYPTED_EXTENSIONS => "EncryptedExtensions",
            Self::CERTIFICATE => "Certificate",
            Self::SERVER_KEY_EXCHANGE => "ServerKeyExchange",
            Self::CERTIFICATE_REQUEST => "CertificateRequest",
            Self::SERVER_HELLO_DONE => "ServerHelloDone",
            Self::CERTIFICATE_VERIFY => "CertificateVerify",
            Self::CLIENT_KEY_EXCHANGE => "ClientKeyExchange",
            Self::FINISHED => "Finished",
            Self::CERTIFICATE_STATUS => "CertificateStatus",
            Self::KEY_UPDATE => "KeyUpdate",
            Self::MESSAGE_HASH => "MessageHash",
            _ => return write!(f, "HandshakeType({})", self.0),
        };

        f.write_str(name)
    }
}

/// TLS version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TlsVersion {
    /// TLS 1.2.
    V1_2,
    /// TLS 1.3.
    V1_3,
}

impl TlsVersion {
    /// Wire value of TLS 1.2.
    pub const TLS12: u16 = 0x0303;
    /// Wire value of TLS 1.3.
    pub const TLS13: u16 = 0x0304;

    /// Parses a wire protocol version.
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            Self::TLS12 => Some(Self::V1_2),
            Self::TLS13 => Some(Self::V1_3),
            _ => None,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::V1_2 => write!(f, "TLSv1.2"),
            TlsVersion::V1_3 => write!(f, "TLSv1.3"),
        }
    }
}

/// Cipher suite identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CipherSuite(pub u16);

#[allow(missing_docs)]
impl CipherSuite {
    pub const TLS13_AES_128_GCM_SHA256: Self = Self(0x1301);
    pub const TLS13_AES_256_GCM_SHA384: Self = Self(0x1302);
    pub const TLS13_CHACHA20_POLY1305_SHA256: Self = Self(0x1303);
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: Self = Self(0xc02b);
    pub const TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384: Self = Self(0xc02c);
    pub const TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: Self = Self(0xc02f);
    pub const TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384: Self = Self(0xc030);
    pub const TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256: Self = Self(0xcca8);
    pub const TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256: Self = Self(0xcca9);
}

impl fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::TLS13_AES_128_GCM_SHA256 => "TLS13_AES_128_GCM_SHA256",
            Self::TLS13_AES_256_GCM_SHA384 => "TLS13_AES_256_GCM_SHA384",
            Self::TLS13_CHACHA20_POLY1305_SHA256 => "TLS13_CHACHA20_POLY1305_SHA256",
            Self::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 => {
                "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256"
            }
            Self::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 => {
                "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384"
            }
            Self::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
            Self::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
            Self::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => {
                "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256"
            }
            Self::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 => {
                "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256"
            }
            _ => return write!(f, "CipherSuite({:#06x})", self.0),
        };

        f.write_str(name)
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Signature scheme used in `CertificateVerify` and `ServerKeyExchange`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureScheme(pub u16);

#[allow(missing_docs)]
impl SignatureScheme {
    pub const RSA_PKCS1_SHA256: Self = Self(0x0401);
    pub const RSA_PKCS1_SHA384: Self = Self(0x0501);
    pub const RSA_PKCS1_SHA512: Self = Self(0x0601);
    pub const ECDSA_NISTP256_SHA256: Self = Self(0x0403);
    pub const ECDSA_NISTP384_SHA384: Self = Self(0x0503);
    pub const RSA_PSS_SHA256: Self = Self(0x0804);
    pub const RSA_PSS_SHA384: Self = Self(0x0805);
    pub const RSA_PSS_SHA512: Self = Self(0x0806);
    pub const ED25519: Self = Self(0x0807);
}

impl fmt::Debug for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::RSA_PKCS1_SHA256 => "RSA_PKCS1_SHA256",
            Self::RSA_PKCS1_SHA384 => "RSA_PKCS1_SHA384",
            Self::RSA_PKCS1_SHA512 => "RSA_PKCS1_SHA512",
            Self::ECDSA_NISTP256_SHA256 => "ECDSA_NISTP256_SHA256",
            Self::ECDSA_NISTP384_SHA384 => "ECDSA_NISTP384_SHA384",
            Self::RSA_PSS_SHA256 => "RSA_PSS_SHA256",
            Self::RSA_PSS_SHA384 => "RSA_PSS_SHA384",
            Self::RSA_PSS_SHA512 => "RSA_PSS_SHA512",
            Self::ED25519 => "ED25519",
            _ => return write!(f, "SignatureScheme({:#06x})", self.0),
        };

        f.write_str(name)
    }
}

/// Extension identifiers this crate looks at.
pub(crate) mod extension {
    pub(crate) const SERVER_NAME: u16 = 0;
    pub(crate) const SUPPORTED_VERSIONS: u16 = 43;
}

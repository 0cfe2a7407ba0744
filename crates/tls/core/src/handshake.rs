//! Parsers for the handshake messages needed to verify a server.

use rustls_pki_types::CertificateDer;

use crate::{
    codec::{DecodeError, Reader},
    enums::{extension, CipherSuite, HandshakeType, SignatureScheme, TlsVersion},
};

/// Length of a handshake message header.
pub const HEADER_LEN: usize = 4;

/// `ServerHello.random` of a HelloRetryRequest, RFC 8446 section 4.1.3.
pub const HELLO_RETRY_REQUEST_RANDOM: [u8; 32] = [
    0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8, 0x91,
    0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8, 0x33, 0x9c,
];

/// Reads the header of the handshake message at the front of `buf`.
///
/// Returns the message type and the total length of the message including
/// its header, or `None` if the message is not complete yet.
pub fn parse_message_prefix(buf: &[u8]) -> Option<(HandshakeType, usize)> {
    if buf.len() < HEADER_LEN {
        return None;
    }

    let len = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]) as usize;
    let total = HEADER_LEN + len;
    (buf.len() >= total).then_some((HandshakeType(buf[0]), total))
}

/// The fields of a ClientHello the verifier needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// Client random.
    pub random: [u8; 32],
    /// Host name from the server_name extension.
    pub server_name: Option<String>,
}

impl ClientHello {
    /// Parses a ClientHello body.
    pub fn parse(body: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(body);
        r.u16()?;
        let random = r.array::<32>()?;
        r.vec_u8()?;
        r.vec_u16()?;
        r.vec_u8()?;

        let mut server_name = None;
        if r.any_left() {
            let mut exts = Reader::new(r.vec_u16()?);
            while exts.any_left() {
                let typ = exts.u16()?;
                let data = exts.vec_u16()?;
                if typ == extension::SERVER_NAME {
                    server_name = parse_server_name(data)?;
                }
            }
        }
        r.expect_empty("trailing bytes after ClientHello")?;

        Ok(Self {
            random,
            server_name,
        })
    }
}

fn parse_server_name(data: &[u8]) -> Result<Option<String>, DecodeError> {
    let mut r = Reader::new(data);
    let mut list = Reader::new(r.vec_u16()?);
    while list.any_left() {
        let name_type = list.u8()?;
        let name = list.vec_u16()?;
        if name_type == 0 {
            let name = std::str::from_utf8(name)
                .map_err(|_| DecodeError("server name is not utf-8"))?;
            return Ok(Some(name.to_string()));
        }
    }

    Ok(None)
}

/// The fields of a ServerHello the verifier needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    /// Server random.
    pub random: [u8; 32],
    /// Selected cipher suite.
    pub cipher_suite: CipherSuite,
    /// Negotiated version, `None` if the server picked something unsupported.
    pub version: Option<TlsVersion>,
}

impl ServerHello {
    /// Parses a ServerHello body.
    pub fn parse(body: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(body);
        let legacy_version = r.u16()?;
        let random = r.array::<32>()?;
        r.vec_u8()?;
        let cipher_suite = CipherSuite(r.u16()?);
        r.u8()?;

        let mut version = legacy_version;
        if r.any_left() {
            let mut exts = Reader::new(r.vec_u16()?);
            while exts.any_left() {
                let typ = exts.u16()?;
                let data = exts.vec_u16()?;
                if typ == extension::SUPPORTED_VERSIONS {
                    let mut ext = Reader::new(data);
                    version = ext.u16()?;
                    ext.expect_empty("invalid supported_versions extension")?;
                }
            }
        }
        r.expect_empty("trailing bytes after ServerHello")?;

        Ok(Self {
            random,
            cipher_suite,
            version: TlsVersion::from_u16(version),
        })
    }

    /// Returns `true` if this is a HelloRetryRequest.
    pub fn is_hello_retry_request(&self) -> bool {
        self.random == HELLO_RETRY_REQUEST_RANDOM
    }
}

/// Parses a Certificate message body into the DER certificate chain.
pub fn parse_certificate(
    body: &[u8],
    version: TlsVersion,
) -> Result<Vec<CertificateDer<'static>>, DecodeError> {
    let mut r = Reader::new(body);
    if version == TlsVersion::V1_3 {
        r.vec_u8()?;
    }

    let mut list = Reader::new(r.vec_u24()?);
    r.expect_empty("trailing bytes after Certificate")?;

    let mut certs = Vec::new();
    while list.any_left() {
        certs.push(CertificateDer::from(list.vec_u24()?.to_vec()));
        if version == TlsVersion::V1_3 {
            list.vec_u16()?;
        }
    }

    Ok(certs)
}

/// A signature together with the scheme which produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigitallySigned {
    /// Signature scheme.
    pub scheme: SignatureScheme,
    /// Raw signature bytes.
    pub signature: Vec<u8>,
}

impl DigitallySigned {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let scheme = SignatureScheme(r.u16()?);
        let signature = r.vec_u16()?.to_vec();
        Ok(Self { scheme, signature })
    }

    /// Parses a TLS 1.3 CertificateVerify body.
    pub fn parse_certificate_verify(body: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(body);
        let signed = Self::read(&mut r)?;
        r.expect_empty("trailing bytes after CertificateVerify")?;
        Ok(signed)
    }
}

/// An ECDHE ServerKeyExchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeyExchange {
    /// The encoded `ServerECDHParams`, which is what the server signs.
    pub params: Vec<u8>,
    /// Signature over the randoms and `params`.
    pub signed: DigitallySigned,
}

impl ServerKeyExchange {
    /// Parses a ServerKeyExchange body for an ECDHE suite.
    pub fn parse(body: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(body);

        // named_curve(3)
        if r.u8()? != 3 {
            return Err(DecodeError("unsupported ECDHE curve type"));
        }
        r.u16()?;
        r.vec_u8()?;
        let params = body[..r.used()].to_vec();

        let signed = DigitallySigned::read(&mut r)?;
        r.expect_empty("trailing bytes after ServerKeyExchange")?;

        Ok(Self { params, signed })
    }
}

//! Record decryption.

use std::fmt;

use ring::aead;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    enums::{ContentType, TlsVersion},
    record::{TlsRecord, HEADER_LEN},
    suites::SuiteParams,
};

/// Length of the AEAD authentication tag for all supported suites.
pub const TAG_LEN: usize = 16;

/// Key material needed to decrypt a single record.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RecordKey {
    /// Traffic key.
    pub key: Vec<u8>,
    /// Write IV. For TLS 1.2 GCM suites this is the 4 byte implicit part.
    pub iv: Vec<u8>,
    /// Record sequence number within the current key epoch.
    pub seq: u64,
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordKey")
            .field("key", &"[redacted]")
            .field("iv", &"[redacted]")
            .field("seq", &self.seq)
            .finish()
    }
}

/// A decrypted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainRecord {
    /// The true content type of the record.
    pub content_type: ContentType,
    /// Decrypted payload.
    pub data: Vec<u8>,
}

/// Errors that can occur while decrypting a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[allow(missing_docs)]
pub enum DecryptError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("invalid iv length: expected {expected}, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },
    #[error("record is not encrypted: {0:?}")]
    NotEncrypted(ContentType),
    #[error("record payload is too short")]
    PayloadTooShort,
    #[error("record authentication failed")]
    BadRecordMac,
    #[error("record has no content type")]
    MissingContentType,
    #[error("record has unknown inner content type: {0}")]
    UnknownContentType(u8),
}

/// Decrypts `record` with `key` under the given suite.
pub fn decrypt_record(
    params: &SuiteParams,
    key: &RecordKey,
    record: &TlsRecord,
) -> Result<PlainRecord, DecryptError> {
    let expected_key = params.aead.key_len();
    if key.key.len() != expected_key {
        return Err(DecryptError::InvalidKeyLength {
            expected: expected_key,
            actual: key.key.len(),
        });
    }

    let unbound = aead::UnboundKey::new(params.aead.ring(), &key.key)
        .map_err(|_| DecryptError::InvalidKeyLength {
            expected: expected_key,
            actual: key.key.len(),
        })?;
    let opening_key = aead::LessSafeKey::new(unbound);

    match params.version {
        TlsVersion::V1_3 => decrypt_tls13(&opening_key, key, record),
        TlsVersion::V1_2 => decrypt_tls12(params, &opening_key, key, record),
    }
}

fn decrypt_tls13(
    opening_key: &aead::LessSafeKey,
    key: &RecordKey,
    record: &TlsRecord,
) -> Result<PlainRecord, DecryptError> {
    if record.content_type != ContentType::ApplicationData {
        return Err(DecryptError::NotEncrypted(record.content_type));
    }
    if record.payload.len() < TAG_LEN {
        return Err(DecryptError::PayloadTooShort);
    }

    let iv = full_iv(&key.iv)?;
    let nonce = aead::Nonce::assume_unique_for_key(make_nonce(&iv, key.seq));
    let aad: [u8; HEADER_LEN] = record.header();

    let mut buf = record.payload.clone();
    let plain_len = opening_key
        .open_in_place(nonce, aead::Aad::from(aad), &mut buf)
        .map_err(|_| DecryptError::BadRecordMac)?
        .len();
    buf.truncate(plain_len);

    // TLSInnerPlaintext: content || content_type || zeros
    while buf.last() == Some(&0) {
        buf.pop();
    }
    let ty = buf.pop().ok_or(DecryptError::MissingContentType)?;
    let content_type = ContentType::from_u8(ty).ok_or(DecryptError::UnknownContentType(ty))?;

    Ok(PlainRecord {
        content_type,
        data: buf,
    })
}

fn decrypt_tls12(
    params: &SuiteParams,
    opening_key: &aead::LessSafeKey,
    key: &RecordKey,
    record: &TlsRecord,
) -> Result<PlainRecord, DecryptError> {
    if record.content_type == ContentType::ChangeCipherSpec {
        return Err(DecryptError::NotEncrypted(record.content_type));
    }

    let fixed_len = params.aead.tls12_fixed_iv_len();
    if key.iv.len() != fixed_len {
        return Err(DecryptError::InvalidIvLength {
            expected: fixed_len,
            actual: key.iv.len(),
        });
    }

    let explicit_len = params.aead.tls12_explicit_nonce_len();
    if record.payload.len() < explicit_len + TAG_LEN {
        return Err(DecryptError::PayloadTooShort);
    }

    let nonce = if explicit_len > 0 {
        let mut nonce = [0u8; aead::NONCE_LEN];
        nonce[..fixed_len].copy_from_slice(&key.iv);
        nonce[fixed_len..].copy_from_slice(&record.payload[..explicit_len]);
        nonce
    } else {
        make_nonce(&full_iv(&key.iv)?, key.seq)
    };

    let plain_len = record.payload.len() - explicit_len - TAG_LEN;
    let mut aad = [0u8; 13];
    aad[..8].copy_from_slice(&key.seq.to_be_bytes());
    aad[8] = record.content_type.as_u8();
    aad[9..11].copy_from_slice(&record.version.to_be_bytes());
    aad[11..].copy_from_slice(&(plain_len as u16).to_be_bytes());

    let mut buf = record.payload[explicit_len..].to_vec();
    opening_key
        .open_in_place(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::from(aad),
            &mut buf,
        )
        .map_err(|_| DecryptError::BadRecordMac)?;
    buf.truncate(plain_len);

    Ok(PlainRecord {
        content_type: record.content_type,
        data: buf,
    })
}

fn full_iv(iv: &[u8]) -> Result<[u8; aead::NONCE_LEN], DecryptError> {
    iv.try_into().map_err(|_| DecryptError::InvalidIvLength {
        expected: aead::NONCE_LEN,
        actual: iv.len(),
    })
}

/// Combines an `iv` and sequence number to produce a unique nonce.
///
/// This is `iv ^ seq` where `seq` is encoded as a 96-bit big-endian integer.
pub(crate) fn make_nonce(iv: &[u8; aead::NONCE_LEN], seq: u64) -> [u8; aead::NONCE_LEN] {
    let mut nonce = [0u8; aead::NONCE_LEN];
    nonce[4..].copy_from_slice(&seq.to_be_bytes());

    nonce.iter_mut().zip(iv.iter()).for_each(|(nonce, iv)| {
        *nonce ^= *iv;
    });

    nonce
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// Seals `plaintext` into a TLS 1.3 record, mirroring `decrypt_tls13`.
    pub(crate) fn seal_tls13(
        params: &SuiteParams,
        key: &RecordKey,
        content_type: ContentType,
        plaintext: &[u8],
    ) -> TlsRecord {
        let sealing_key = aead::LessSafeKey::new(
            aead::UnboundKey::new(params.aead.ring(), &key.key).unwrap(),
        );
        let mut buf = plaintext.to_vec();
        buf.push(content_type.as_u8());

        let len = (buf.len() + TAG_LEN) as u16;
        let [l0, l1] = len.to_be_bytes();
        let aad = [ContentType::ApplicationData.as_u8(), 0x03, 0x03, l0, l1];
        let nonce = make_nonce(&key.iv.as_slice().try_into().unwrap(), key.seq);

        sealing_key
            .seal_in_place_append_tag(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::from(aad),
                &mut buf,
            )
            .unwrap();

        TlsRecord {
            content_type: ContentType::ApplicationData,
            version: 0x0303,
            payload: buf,
        }
    }

    /// Seals `plaintext` into a TLS 1.2 GCM record with the given explicit nonce.
    pub(crate) fn seal_tls12_gcm(
        params: &SuiteParams,
        key: &RecordKey,
        content_type: ContentType,
        explicit: [u8; 8],
        plaintext: &[u8],
    ) -> TlsRecord {
        let sealing_key = aead::LessSafeKey::new(
            aead::UnboundKey::new(params.aead.ring(), &key.key).unwrap(),
        );
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&key.iv);
        nonce[4..].copy_from_slice(&explicit);

        let mut aad = [0u8; 13];
        aad[..8].copy_from_slice(&key.seq.to_be_bytes());
        aad[8] = content_type.as_u8();
        aad[9..11].copy_from_slice(&[0x03, 0x03]);
        aad[11..].copy_from_slice(&(plaintext.len() as u16).to_be_bytes());

        let mut buf = plaintext.to_vec();
        sealing_key
            .seal_in_place_append_tag(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::from(aad),
                &mut buf,
            )
            .unwrap();

        let mut payload = explicit.to_vec();
        payload.extend(buf);

        TlsRecord {
            content_type,
            version: 0x0303,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test_utils::*, *};
    use crate::enums::CipherSuite;

    fn tls13_params() -> SuiteParams {
        SuiteParams::lookup(CipherSuite::TLS13_AES_128_GCM_SHA256).unwrap()
    }

    fn tls13_key(seq: u64) -> RecordKey {
        RecordKey {
            key: vec![7u8; 16],
            iv: vec![9u8; 12],
            seq,
        }
    }

    #[test]
    fn test_make_nonce() {
        let iv = [0xffu8; 12];
        let nonce = make_nonce(&iv, 1);
        assert_eq!(&nonce[..11], &[0xffu8; 11]);
        assert_eq!(nonce[11], 0xfe);
    }

    #[test]
    fn test_tls13_decrypt() {
        let params = tls13_params();
        let key = tls13_key(3);
        let record = seal_tls13(&params, &key, ContentType::ApplicationData, b"GET / HTTP/1.1");

        let plain = decrypt_record(&params, &key, &record).unwrap();
        assert_eq!(plain.content_type, ContentType::ApplicationData);
        assert_eq!(plain.data, b"GET / HTTP/1.1");
    }

    #[test]
    fn test_tls13_decrypt_inner_handshake_type() {
        let params = tls13_params();
        let key = tls13_key(0);
        let record = seal_tls13(&params, &key, ContentType::Handshake, &[20, 0, 0, 0]);

        let plain = decrypt_record(&params, &key, &record).unwrap();
        assert_eq!(plain.content_type, ContentType::Handshake);
    }

    #[test]
    fn test_tls13_wrong_seq_fails() {
        let params = tls13_params();
        let record = seal_tls13(&params, &tls13_key(0), ContentType::ApplicationData, b"x");

        assert_eq!(
            decrypt_record(&params, &tls13_key(1), &record),
            Err(DecryptError::BadRecordMac)
        );
    }

    #[test]
    fn test_tls13_wrong_key_length() {
        let params = tls13_params();
        let record = seal_tls13(&params, &tls13_key(0), ContentType::ApplicationData, b"x");
        let mut key = tls13_key(0);
        key.key.truncate(5);

        assert!(matches!(
            decrypt_record(&params, &key, &record),
            Err(DecryptError::InvalidKeyLength { expected: 16, .. })
        ));
    }

    #[test]
    fn test_tls12_gcm_decrypt() {
        let params =
            SuiteParams::lookup(CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256).unwrap();
        let key = RecordKey {
            key: vec![1u8; 16],
            iv: vec![2u8; 4],
            seq: 1,
        };
        let record = seal_tls12_gcm(
            &params,
            &key,
            ContentType::ApplicationData,
            [0, 0, 0, 0, 0, 0, 0, 1],
            b"HTTP/1.1 200 OK",
        );

        let plain = decrypt_record(&params, &key, &record).unwrap();
        assert_eq!(plain.data, b"HTTP/1.1 200 OK");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let printed = format!("{:?}", tls13_key(4));
        assert!(printed.contains("redacted"));
        assert!(!printed.contains('7'));
    }
}

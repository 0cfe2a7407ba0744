//! Handshake reconstruction.
//!
//! Replays a captured TLS record stream, decrypting only the records whose
//! keys were revealed, to recover the negotiated parameters, the server's
//! certificate chain and the application data records. The server's
//! handshake signature is checked while replaying and the certificate chain
//! is verified once the stream is complete.

use rustls_pki_types::CertificateDer;
use tracing::{debug, trace};

use crate::{
    cipher::{decrypt_record, DecryptError, RecordKey},
    codec::{put_u24, DecodeError},
    enums::{CipherSuite, ContentType, HandshakeType, TlsVersion},
    handshake::{
        parse_certificate, parse_message_prefix, ClientHello, DigitallySigned, ServerHello,
        ServerKeyExchange, HEADER_LEN,
    },
    record::{Sender, TlsRecord},
    suites::SuiteParams,
    verify::{
        tls12_signed_message, tls13_signed_message, verify_signature, ServerCertVerifier,
        ServerCertVerifierError,
    },
};

/// A record of a captured TLS stream.
#[derive(Debug, Clone)]
pub struct TranscriptRecord {
    /// Who sent the record.
    pub sender: Sender,
    /// The record as it appeared on the wire.
    pub record: TlsRecord,
    /// The key the record was encrypted with, if it was revealed.
    pub key: Option<RecordKey>,
}

/// An application data record sent after the sender finished its handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationRecord {
    /// Who sent the record.
    pub sender: Sender,
    /// Position of the record in the transcript.
    pub index: usize,
    /// Decrypted content, `None` if the record was not revealed.
    pub plaintext: Option<Vec<u8>>,
}

/// The outcome of a successful reconstruction.
#[derive(Debug, Clone)]
pub struct HandshakeSummary {
    /// Negotiated protocol version.
    pub version: TlsVersion,
    /// Negotiated cipher suite.
    pub cipher_suite: CipherSuite,
    /// Host name the client asked for.
    pub server_name: String,
    /// Client random.
    pub client_random: [u8; 32],
    /// Server random.
    pub server_random: [u8; 32],
    /// Certificate chain presented by the server, leaf first.
    pub certificates: Vec<CertificateDer<'static>>,
    /// Application data records in transcript order.
    pub application_data: Vec<ApplicationRecord>,
}

impl HandshakeSummary {
    /// Concatenates the revealed plaintext sent by `sender`.
    pub fn revealed_plaintext(&self, sender: Sender) -> Vec<u8> {
        self.application_data
            .iter()
            .filter(|record| record.sender == sender)
            .filter_map(|record| record.plaintext.as_deref())
            .flatten()
            .copied()
            .collect()
    }

    /// Returns the revealed plaintext sent by `sender` as runs of adjacent
    /// revealed records. A hidden record from `sender` ends the current run,
    /// so no run spans bytes the attestor did not see.
    pub fn revealed_runs(&self, sender: Sender) -> Vec<Vec<u8>> {
        let mut runs = Vec::new();
        let mut run = Vec::new();
        for record in self.application_data.iter().filter(|r| r.sender == sender) {
            match &record.plaintext {
                Some(plaintext) => run.extend_from_slice(plaintext),
                None if !run.is_empty() => runs.push(std::mem::take(&mut run)),
                None => {}
            }
        }
        if !run.is_empty() {
            runs.push(run);
        }
        runs
    }

    /// Returns the plaintext of the leading revealed records sent by
    /// `sender`, stopping at the first hidden one.
    pub fn revealed_prefix(&self, sender: Sender) -> Vec<u8> {
        self.application_data
            .iter()
            .filter(|record| record.sender == sender)
            .map_while(|record| record.plaintext.as_deref())
            .flatten()
            .copied()
            .collect()
    }
}

/// Errors that can occur while reconstructing a handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The record stream does not form a valid handshake.
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),
    /// A handshake message is malformed.
    #[error("malformed handshake message: {0}")]
    Decode(#[from] DecodeError),
    /// A revealed record failed to decrypt.
    #[error("failed to decrypt {sender} record {index}: {source}")]
    Decrypt {
        /// Sender of the record.
        sender: Sender,
        /// Position of the record in the transcript.
        index: usize,
        /// The decryption failure.
        source: DecryptError,
    },
    /// The certificate chain is not trusted for the server name.
    #[error("certificate verification failed: {0}")]
    Certificate(#[source] ServerCertVerifierError),
    /// The server's handshake signature is invalid.
    #[error("handshake signature verification failed: {0}")]
    Signature(#[source] ServerCertVerifierError),
}

impl HandshakeError {
    fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidHandshake(msg.into())
    }

    /// Returns `true` if the failure is attributable to the server's
    /// certificate or signature rather than to the shape of the transcript.
    pub fn is_certificate_error(&self) -> bool {
        matches!(self, Self::Certificate(_) | Self::Signature(_))
    }
}

#[derive(Debug, Default)]
struct SenderState {
    /// Handshake bytes received but not yet forming a whole message.
    buf: Vec<u8>,
    change_cipher_spec: bool,
    finished: bool,
}

/// Incrementally reconstructs a TLS handshake from a record stream.
///
/// Records are pushed in the order they were observed. Records from both
/// parties interleave, each party's handshake bytes are reassembled
/// separately so messages may span records.
#[derive(Debug, Default)]
pub struct HandshakeReconstructor {
    client: SenderState,
    server: SenderState,
    /// Handshake messages hashed for the TLS 1.3 CertificateVerify.
    transcript: Vec<u8>,
    client_hello: Option<ClientHello>,
    server_hello: Option<ServerHello>,
    params: Option<SuiteParams>,
    certificates: Vec<CertificateDer<'static>>,
    signature_verified: bool,
    application_data: Vec<ApplicationRecord>,
    records: usize,
}

impl HandshakeReconstructor {
    /// Creates a new reconstructor.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&mut self, sender: Sender) -> &mut SenderState {
        match sender {
            Sender::Client => &mut self.client,
            Sender::Server => &mut self.server,
        }
    }

    fn version(&self) -> Option<TlsVersion> {
        self.params.map(|params| params.version)
    }

    /// Pushes the next record of the stream.
    pub fn push_record(
        &mut self,
        sender: Sender,
        record: &TlsRecord,
        key: Option<&RecordKey>,
    ) -> Result<(), HandshakeError> {
        let index = self.records;
        self.records += 1;

        trace!(%sender, index, content_type = ?record.content_type, "replaying record");

        if self.state(sender).finished {
            return self.push_post_handshake(sender, index, record, key);
        }

        match record.content_type {
            ContentType::ChangeCipherSpec => {
                self.state(sender).change_cipher_spec = true;
                Ok(())
            }
            ContentType::Alert => Err(HandshakeError::invalid(format!(
                "{sender} sent an alert during the handshake"
            ))),
            ContentType::Handshake => {
                let encrypted = self.version() == Some(TlsVersion::V1_2)
                    && self.state(sender).change_cipher_spec;

                if !encrypted {
                    return self.push_handshake_bytes(sender, &record.payload);
                }

                match key {
                    Some(key) => {
                        let plain = self.decrypt(sender, index, record, key)?;
                        self.push_handshake_bytes(sender, &plain.data)
                    }
                    // An unrevealed TLS 1.2 record after ChangeCipherSpec can
                    // only be the sender's Finished.
                    None => {
                        debug!(%sender, index, "accepting unrevealed Finished");
                        self.state(sender).finished = true;
                        Ok(())
                    }
                }
            }
            ContentType::ApplicationData => {
                if self.version() != Some(TlsVersion::V1_3) {
                    return Err(HandshakeError::invalid(format!(
                        "{sender} sent application data before finishing the handshake"
                    )));
                }

                let key = key.ok_or_else(|| {
                    HandshakeError::invalid(format!(
                        "encrypted handshake record {index} from {sender} was not revealed"
                    ))
                })?;

                let plain = self.decrypt(sender, index, record, key)?;
                match plain.content_type {
                    ContentType::Handshake => self.push_handshake_bytes(sender, &plain.data),
                    ContentType::Alert => Err(HandshakeError::invalid(format!(
                        "{sender} sent an alert during the handshake"
                    ))),
                    other => Err(HandshakeError::invalid(format!(
                        "unexpected {other:?} record from {sender} during the handshake"
                    ))),
                }
            }
        }
    }

    fn push_post_handshake(
        &mut self,
        sender: Sender,
        index: usize,
        record: &TlsRecord,
        key: Option<&RecordKey>,
    ) -> Result<(), HandshakeError> {
        match record.content_type {
            ContentType::ApplicationData => {}
            // Closing alerts carry no application data.
            ContentType::Alert | ContentType::ChangeCipherSpec => return Ok(()),
            ContentType::Handshake => {
                return Err(HandshakeError::invalid(format!(
                    "{sender} attempted to renegotiate"
                )))
            }
        }

        let Some(key) = key else {
            self.application_data.push(ApplicationRecord {
                sender,
                index,
                plaintext: None,
            });
            return Ok(());
        };

        let plain = self.decrypt(sender, index, record, key)?;
        match plain.content_type {
            ContentType::ApplicationData => {
                self.application_data.push(ApplicationRecord {
                    sender,
                    index,
                    plaintext: Some(plain.data),
                });
                Ok(())
            }
            ContentType::Handshake => self.check_post_handshake_message(sender, &plain.data),
            _ => Ok(()),
        }
    }

    fn check_post_handshake_message(
        &mut self,
        sender: Sender,
        data: &[u8],
    ) -> Result<(), HandshakeError> {
        let mut offset = 0;
        while let Some((typ, len)) = parse_message_prefix(&data[offset..]) {
            match typ {
                HandshakeType::NEW_SESSION_TICKET => {}
                HandshakeType::KEY_UPDATE => {
                    return Err(HandshakeError::invalid(format!(
                        "{sender} sent KeyUpdate, which is not supported"
                    )))
                }
                other => {
                    return Err(HandshakeError::invalid(format!(
                        "unexpected post-handshake message {other:?} from {sender}"
                    )))
                }
            }
            offset += len;
        }

        Ok(())
    }

    fn decrypt(
        &self,
        sender: Sender,
        index: usize,
        record: &TlsRecord,
        key: &RecordKey,
    ) -> Result<crate::cipher::PlainRecord, HandshakeError> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| HandshakeError::invalid("encrypted record before ServerHello"))?;

        decrypt_record(params, key, record).map_err(|source| HandshakeError::Decrypt {
            sender,
            index,
            source,
        })
    }

    /// Appends handshake bytes from `sender` and processes every whole
    /// message now available. Partial messages wait for the next record.
    fn push_handshake_bytes(&mut self, sender: Sender, data: &[u8]) -> Result<(), HandshakeError> {
        let mut buf = std::mem::take(&mut self.state(sender).buf);
        buf.extend_from_slice(data);

        let mut cursor = 0;
        let result = loop {
            let Some((typ, len)) = parse_message_prefix(&buf[cursor..]) else {
                break Ok(());
            };

            let message = &buf[cursor..cursor + len];
            if let Err(err) = self.handle_message(sender, typ, message) {
                break Err(err);
            }
            cursor += len;
        };

        buf.drain(..cursor);
        self.state(sender).buf = buf;
        result
    }

    fn handle_message(
        &mut self,
        sender: Sender,
        typ: HandshakeType,
        message: &[u8],
    ) -> Result<(), HandshakeError> {
        let body = &message[HEADER_LEN..];
        debug!(%sender, message = ?typ, len = body.len(), "handshake message");

        let expected_sender = match typ {
            HandshakeType::CLIENT_HELLO
            | HandshakeType::CLIENT_KEY_EXCHANGE
            | HandshakeType::END_OF_EARLY_DATA => Some(Sender::Client),
            HandshakeType::SERVER_HELLO
            | HandshakeType::ENCRYPTED_EXTENSIONS
            | HandshakeType::SERVER_KEY_EXCHANGE
            | HandshakeType::SERVER_HELLO_DONE
            | HandshakeType::CERTIFICATE_REQUEST
            | HandshakeType::NEW_SESSION_TICKET => Some(Sender::Server),
            _ => None,
        };
        if let Some(expected) = expected_sender {
            if expected != sender {
                return Err(HandshakeError::invalid(format!(
                    "{typ:?} must be sent by the {expected}"
                )));
            }
        }

        match typ {
            HandshakeType::CLIENT_HELLO => {
                if self.server_hello.is_some() {
                    return Err(HandshakeError::invalid("ClientHello after ServerHello"));
                }
                self.client_hello = Some(ClientHello::parse(body)?);
            }
            HandshakeType::SERVER_HELLO => {
                if self.client_hello.is_none() {
                    return Err(HandshakeError::invalid("ServerHello before ClientHello"));
                }
                if self.server_hello.is_some() {
                    return Err(HandshakeError::invalid("duplicate ServerHello"));
                }

                let hello = ServerHello::parse(body)?;
                let params = SuiteParams::lookup(hello.cipher_suite).ok_or_else(|| {
                    HandshakeError::invalid(format!(
                        "unsupported cipher suite {:?}",
                        hello.cipher_suite
                    ))
                })?;
                if hello.version != Some(params.version) {
                    return Err(HandshakeError::invalid(format!(
                        "cipher suite {:?} does not match the negotiated version",
                        hello.cipher_suite
                    )));
                }

                if hello.is_hello_retry_request() {
                    // The transcript restarts with a synthetic message_hash
                    // of the first ClientHello.
                    let hash = params.hash.digest(&self.transcript);
                    self.transcript.clear();
                    self.transcript.push(HandshakeType::MESSAGE_HASH.0);
                    put_u24(hash.len() as u32, &mut self.transcript);
                    self.transcript.extend_from_slice(&hash);
                    self.transcript.extend_from_slice(message);
                    self.params = Some(params);
                    return Ok(());
                }

                self.params = Some(params);
                self.server_hello = Some(hello);
            }
            HandshakeType::CERTIFICATE if sender == Sender::Server => {
                let version = self
                    .version()
                    .ok_or_else(|| HandshakeError::invalid("Certificate before ServerHello"))?;
                let certificates = parse_certificate(body, version)?;
                if certificates.is_empty() {
                    return Err(HandshakeError::invalid("server sent an empty certificate chain"));
                }
                self.certificates = certificates;
            }
            HandshakeType::CERTIFICATE_VERIFY if sender == Sender::Server => {
                self.verify_certificate_verify(body)?;
            }
            HandshakeType::SERVER_KEY_EXCHANGE => {
                self.verify_server_key_exchange(body)?;
            }
            HandshakeType::FINISHED => {
                if self.server_hello.is_none() {
                    return Err(HandshakeError::invalid("Finished before ServerHello"));
                }
                let tls12 = self.version() == Some(TlsVersion::V1_2);
                if tls12 && !self.state(sender).change_cipher_spec {
                    return Err(HandshakeError::invalid(format!(
                        "{sender} sent Finished before ChangeCipherSpec"
                    )));
                }
                self.state(sender).finished = true;
            }
            HandshakeType::KEY_UPDATE => {
                return Err(HandshakeError::invalid("KeyUpdate is not supported"));
            }
            _ => {}
        }

        self.transcript.extend_from_slice(message);
        Ok(())
    }

    fn leaf(&self, before: &str) -> Result<&CertificateDer<'static>, HandshakeError> {
        self.certificates.first().ok_or_else(|| {
            HandshakeError::invalid(format!("no certificates received before {before}"))
        })
    }

    fn verify_certificate_verify(&mut self, body: &[u8]) -> Result<(), HandshakeError> {
        let params = self
            .params
            .filter(|params| params.version == TlsVersion::V1_3)
            .ok_or_else(|| HandshakeError::invalid("CertificateVerify outside of TLS 1.3"))?;
        let leaf = self.leaf("CertificateVerify")?;

        let signed = DigitallySigned::parse_certificate_verify(body)?;
        let transcript_hash = params.hash.digest(&self.transcript);

        verify_signature(
            TlsVersion::V1_3,
            leaf,
            signed.scheme,
            &tls13_signed_message(&transcript_hash),
            &signed.signature,
        )
        .map_err(HandshakeError::Signature)?;

        self.signature_verified = true;
        Ok(())
    }

    fn verify_server_key_exchange(&mut self, body: &[u8]) -> Result<(), HandshakeError> {
        if self.version() != Some(TlsVersion::V1_2) {
            return Err(HandshakeError::invalid(
                "ServerKeyExchange outside of TLS 1.2",
            ));
        }
        let leaf = self.leaf("ServerKeyExchange")?;
        let (Some(client_hello), Some(server_hello)) = (&self.client_hello, &self.server_hello)
        else {
            return Err(HandshakeError::invalid("ServerKeyExchange before hellos"));
        };

        let kx = ServerKeyExchange::parse(body)?;
        let message = tls12_signed_message(&client_hello.random, &server_hello.random, &kx.params);

        verify_signature(
            TlsVersion::V1_2,
            leaf,
            kx.signed.scheme,
            &message,
            &kx.signed.signature,
        )
        .map_err(HandshakeError::Signature)?;

        self.signature_verified = true;
        Ok(())
    }

    /// Completes the reconstruction and verifies the server's certificate
    /// chain as of `time` (seconds since the Unix epoch).
    pub fn finish(
        self,
        verifier: &ServerCertVerifier,
        time: u64,
    ) -> Result<HandshakeSummary, HandshakeError> {
        let client_hello = self
            .client_hello
            .ok_or_else(|| HandshakeError::invalid("missing ClientHello"))?;
        let server_name = client_hello
            .server_name
            .ok_or_else(|| HandshakeError::invalid("no SNI found in ClientHello"))?;
        let server_hello = self
            .server_hello
            .ok_or_else(|| HandshakeError::invalid("missing ServerHello"))?;
        let params = self
            .params
            .ok_or_else(|| HandshakeError::invalid("missing ServerHello"))?;

        if self.certificates.is_empty() {
            return Err(HandshakeError::invalid("no certificates received"));
        }
        if !self.signature_verified {
            return Err(HandshakeError::invalid(
                "server did not sign the handshake",
            ));
        }

        for (sender, state) in [(Sender::Client, &self.client), (Sender::Server, &self.server)] {
            if params.version == TlsVersion::V1_2 && !state.change_cipher_spec {
                return Err(HandshakeError::invalid(format!(
                    "missing ChangeCipherSpec from {sender}"
                )));
            }
            if !state.finished {
                return Err(HandshakeError::invalid(format!(
                    "missing Finished from {sender}"
                )));
            }
            if !state.buf.is_empty() {
                return Err(HandshakeError::invalid(format!(
                    "truncated handshake message from {sender}"
                )));
            }
        }

        let (leaf, intermediates) = self
            .certificates
            .split_first()
            .ok_or_else(|| HandshakeError::invalid("no certificates received"))?;
        verifier
            .verify_server_cert(leaf, intermediates, &server_name, time)
            .map_err(HandshakeError::Certificate)?;

        debug!(
            version = %params.version,
            suite = ?params.suite,
            server_name = %server_name,
            records = self.application_data.len(),
            "handshake verified"
        );

        Ok(HandshakeSummary {
            version: params.version,
            cipher_suite: params.suite,
            server_name,
            client_random: client_hello.random,
            server_random: server_hello.random,
            certificates: self.certificates,
            application_data: self.application_data,
        })
    }
}

/// Reconstructs and verifies the handshake of a whole record stream.
pub fn reconstruct<'a>(
    records: impl IntoIterator<Item = &'a TranscriptRecord>,
    verifier: &ServerCertVerifier,
    time: u64,
) -> Result<HandshakeSummary, HandshakeError> {
    let mut reconstructor = HandshakeReconstructor::new();
    for record in records {
        reconstructor.push_record(record.sender, &record.record, record.key.as_ref())?;
    }
    reconstructor.finish(verifier, time)
}

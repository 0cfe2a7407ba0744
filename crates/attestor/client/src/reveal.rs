//! Selective disclosure of record keys.
//!
//! The TLS client logs its traffic secrets into a [`SecretLog`]. Once the
//! connection is done, [`reveal_records`] replays the captured records,
//! derives the key of every encrypted record and attaches it to the records
//! the [`RevealPolicy`] selects. Records of the handshake are always
//! revealed, the attestor needs them to verify the server.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use attestor_core::{claim::ClaimTranscriptMessage, Transcript};
use tls_core::{
    cipher::{decrypt_record, PlainRecord},
    handshake::{parse_message_prefix, ClientHello, ServerHello, HEADER_LEN},
    key_schedule::{tls12_key_block, tls13_traffic_keys},
    suites::SuiteParams,
    CipherSuite, ContentType, DecryptError, HandshakeType, RecordError, RecordKey, Sender,
    TlsRecord, TlsVersion,
};
use tracing::{debug, trace};
use zeroize::Zeroizing;

const CLIENT_HANDSHAKE_TRAFFIC_SECRET: &str = "CLIENT_HANDSHAKE_TRAFFIC_SECRET";
const SERVER_HANDSHAKE_TRAFFIC_SECRET: &str = "SERVER_HANDSHAKE_TRAFFIC_SECRET";
const CLIENT_TRAFFIC_SECRET_0: &str = "CLIENT_TRAFFIC_SECRET_0";
const SERVER_TRAFFIC_SECRET_0: &str = "SERVER_TRAFFIC_SECRET_0";
const CLIENT_RANDOM: &str = "CLIENT_RANDOM";

/// Captures the secrets a TLS client derives.
#[derive(Default)]
pub struct SecretLog {
    secrets: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

opaque_debug::implement!(SecretLog);

impl SecretLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, label: &'static str) -> Result<Zeroizing<Vec<u8>>, RevealError> {
        self.secrets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(label)
            .cloned()
            .ok_or(RevealError::MissingSecret(label))
    }
}

impl rustls::KeyLog for SecretLog {
    fn log(&self, label: &str, _client_random: &[u8], secret: &[u8]) {
        trace!(label, "captured secret");
        self.secrets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(label.to_string(), Zeroizing::new(secret.to_vec()));
    }
}

type RevealFn = dyn Fn(Sender, &[u8]) -> bool + Send + Sync;

/// Which application data records to reveal to the attestor.
#[derive(Clone, Default)]
pub enum RevealPolicy {
    /// Reveal every record.
    #[default]
    All,
    /// Reveal only what the handshake needs.
    HandshakeOnly,
    /// Reveal the records for which the function, given the sender and the
    /// plaintext of the record, returns `true`.
    Custom(Arc<RevealFn>),
}

impl RevealPolicy {
    /// Creates a [`RevealPolicy::Custom`] policy.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(Sender, &[u8]) -> bool + Send + Sync + 'static,
    {
        RevealPolicy::Custom(Arc::new(f))
    }

    fn reveals(&self, sender: Sender, plaintext: &[u8]) -> bool {
        match self {
            RevealPolicy::All => true,
            RevealPolicy::HandshakeOnly => false,
            RevealPolicy::Custom(f) => f(sender, plaintext),
        }
    }
}

impl fmt::Debug for RevealPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevealPolicy::All => f.write_str("All"),
            RevealPolicy::HandshakeOnly => f.write_str("HandshakeOnly"),
            RevealPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Errors that can occur while deriving the keys of a transcript.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum RevealError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("secret {0} was not logged")]
    MissingSecret(&'static str),
    #[error("unsupported cipher suite {0:?}")]
    UnsupportedSuite(CipherSuite),
    #[error("server selected an unsupported protocol version")]
    UnsupportedVersion,
    #[error("failed to decrypt record {index} from {sender}")]
    Decrypt {
        sender: Sender,
        index: usize,
        #[source]
        source: DecryptError,
    },
    #[error("malformed handshake: {0}")]
    Malformed(String),
    #[error("invalid key material")]
    KeyDerivation,
}

#[derive(Default)]
enum Epoch {
    #[default]
    Plaintext,
    Handshake(RecordKey),
    Application(RecordKey),
}

#[derive(Default)]
struct Direction {
    epoch: Epoch,
    /// Handshake bytes not yet forming a whole message.
    buf: Vec<u8>,
}

impl Direction {
    /// Returns the key for the next record and advances the sequence number.
    fn next_key(&mut self) -> Option<RecordKey> {
        let key = match &mut self.epoch {
            Epoch::Plaintext => return None,
            Epoch::Handshake(key) | Epoch::Application(key) => key,
        };
        let current = key.clone();
        key.seq += 1;
        Some(current)
    }

    /// Appends handshake bytes and returns the types of the whole messages
    /// now available, along with their bodies.
    fn push_handshake(&mut self, data: &[u8]) -> Vec<(HandshakeType, Vec<u8>)> {
        self.buf.extend_from_slice(data);

        let mut messages = Vec::new();
        while let Some((typ, len)) = parse_message_prefix(&self.buf) {
            let message: Vec<u8> = self.buf.drain(..len).collect();
            messages.push((typ, message[HEADER_LEN..].to_vec()));
        }
        messages
    }
}

struct KeySchedule<'a> {
    secrets: &'a SecretLog,
    client_random: Option<[u8; 32]>,
    params: Option<SuiteParams>,
    client: Direction,
    server: Direction,
    /// TLS 1.2 keys, installed when the sender sends ChangeCipherSpec.
    pending_client: Option<RecordKey>,
    pending_server: Option<RecordKey>,
}

impl<'a> KeySchedule<'a> {
    fn new(secrets: &'a SecretLog) -> Self {
        Self {
            secrets,
            client_random: None,
            params: None,
            client: Direction::default(),
            server: Direction::default(),
            pending_client: None,
            pending_server: None,
        }
    }

    fn direction(&mut self, sender: Sender) -> &mut Direction {
        match sender {
            Sender::Client => &mut self.client,
            Sender::Server => &mut self.server,
        }
    }

    fn take_pending(&mut self, sender: Sender) -> Option<RecordKey> {
        match sender {
            Sender::Client => self.pending_client.take(),
            Sender::Server => self.pending_server.take(),
        }
    }

    fn tls13_key(&self, label: &'static str) -> Result<RecordKey, RevealError> {
        let params = self.params.ok_or(RevealError::UnsupportedVersion)?;
        let secret = self.secrets.get(label)?;
        let (key, iv) =
            tls13_traffic_keys(&params, &secret).map_err(|_| RevealError::KeyDerivation)?;
        Ok(RecordKey { key, iv, seq: 0 })
    }

    fn on_plaintext_handshake(&mut self, sender: Sender, data: &[u8]) -> Result<(), RevealError> {
        for (typ, body) in self.direction(sender).push_handshake(data) {
            match typ {
                HandshakeType::CLIENT_HELLO => {
                    let hello = ClientHello::parse(&body)
                        .map_err(|err| RevealError::Malformed(err.to_string()))?;
                    self.client_random = Some(hello.random);
                }
                HandshakeType::SERVER_HELLO => {
                    let hello = ServerHello::parse(&body)
                        .map_err(|err| RevealError::Malformed(err.to_string()))?;
                    if !hello.is_hello_retry_request() {
                        self.on_server_hello(&hello)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn on_server_hello(&mut self, hello: &ServerHello) -> Result<(), RevealError> {
        let params = SuiteParams::lookup(hello.cipher_suite)
            .ok_or(RevealError::UnsupportedSuite(hello.cipher_suite))?;
        if hello.version != Some(params.version) {
            return Err(RevealError::UnsupportedVersion);
        }
        self.params = Some(params);
        debug!(version = %params.version, suite = ?params.suite, "negotiated");

        match params.version {
            TlsVersion::V1_3 => {
                self.client.epoch =
                    Epoch::Handshake(self.tls13_key(CLIENT_HANDSHAKE_TRAFFIC_SECRET)?);
                self.server.epoch =
                    Epoch::Handshake(self.tls13_key(SERVER_HANDSHAKE_TRAFFIC_SECRET)?);
            }
            TlsVersion::V1_2 => {
                let client_random = self
                    .client_random
                    .ok_or_else(|| RevealError::Malformed("ServerHello before ClientHello".into()))?;
                let master = self.secrets.get(CLIENT_RANDOM)?;
                let block = tls12_key_block(&params, &master, &client_random, &hello.random)
                    .map_err(|_| RevealError::KeyDerivation)?;

                self.pending_client = Some(RecordKey {
                    key: block.client_key.clone(),
                    iv: block.client_iv.clone(),
                    seq: 0,
                });
                self.pending_server = Some(RecordKey {
                    key: block.server_key.clone(),
                    iv: block.server_iv.clone(),
                    seq: 0,
                });
            }
        }
        Ok(())
    }

    fn decrypt(
        &self,
        sender: Sender,
        index: usize,
        record: &TlsRecord,
        key: &RecordKey,
    ) -> Result<PlainRecord, RevealError> {
        let params = self.params.ok_or(RevealError::UnsupportedVersion)?;
        decrypt_record(&params, key, record).map_err(|source| RevealError::Decrypt {
            sender,
            index,
            source,
        })
    }

    /// Returns the key of `record` and whether it belongs to the handshake,
    /// along with its plaintext.
    fn process(
        &mut self,
        sender: Sender,
        index: usize,
        record: &TlsRecord,
    ) -> Result<Option<(RecordKey, bool, PlainRecord)>, RevealError> {
        let version = self.params.map(|params| params.version);

        if record.content_type == ContentType::ChangeCipherSpec {
            if version == Some(TlsVersion::V1_2) {
                if let Some(key) = self.take_pending(sender) {
                    self.direction(sender).epoch = Epoch::Handshake(key);
                }
            }
            return Ok(None);
        }

        let Some(key) = self.direction(sender).next_key() else {
            if record.content_type == ContentType::Handshake {
                self.on_plaintext_handshake(sender, &record.payload)?;
            }
            return Ok(None);
        };

        let in_handshake = matches!(self.direction(sender).epoch, Epoch::Handshake(_));
        let plain = self.decrypt(sender, index, record, &key)?;

        if in_handshake && plain.content_type == ContentType::Handshake {
            let finished = self
                .direction(sender)
                .push_handshake(&plain.data)
                .iter()
                .any(|(typ, _)| *typ == HandshakeType::FINISHED);

            if finished {
                trace!(%sender, index, "handshake finished");
                match version {
                    Some(TlsVersion::V1_3) => {
                        let label = match sender {
                            Sender::Client => CLIENT_TRAFFIC_SECRET_0,
                            Sender::Server => SERVER_TRAFFIC_SECRET_0,
                        };
                        self.direction(sender).epoch = Epoch::Application(self.tls13_key(label)?);
                    }
                    // TLS 1.2 keeps the key and sequence number.
                    _ => {
                        let direction = self.direction(sender);
                        if let Epoch::Handshake(key) = std::mem::take(&mut direction.epoch) {
                            direction.epoch = Epoch::Application(key);
                        }
                    }
                }
            }
        }

        Ok(Some((key, in_handshake, plain)))
    }
}

/// Attaches the record keys selected by `policy` to the captured records.
///
/// Every entry of `records` must be exactly one TLS record.
pub fn reveal_records(
    records: &Transcript,
    secrets: &SecretLog,
    policy: &RevealPolicy,
) -> Result<Vec<ClaimTranscriptMessage>, RevealError> {
    let mut schedule = KeySchedule::new(secrets);
    let mut messages = Vec::with_capacity(records.len());
    let mut revealed = 0;

    for (index, entry) in records.iter().enumerate() {
        let record = TlsRecord::parse(&entry.data)?;

        let reveal = match schedule.process(entry.sender, index, &record)? {
            None => None,
            Some((key, true, _)) => Some(key),
            // Protocol messages after the handshake carry no application
            // data, only application data is subject to the policy.
            Some((key, false, plain)) if plain.content_type != ContentType::ApplicationData => {
                Some(key)
            }
            Some((key, false, plain)) => policy.reveals(entry.sender, &plain.data).then_some(key),
        };
        if reveal.is_some() {
            revealed += 1;
        }

        messages.push(ClaimTranscriptMessage {
            sender: entry.sender,
            message: entry.data.clone(),
            reveal,
        });
    }

    debug!(records = messages.len(), revealed, ?policy, "prepared transcript");
    Ok(messages)
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use rustls::{Certificate, ClientConfig, ClientConnection, PrivateKey, ServerConfig, ServerConnection};
    use std::io::{Read, Write};
    use tls_core::RecordSplitter;

    pub(crate) fn root_store() -> rustls::RootCertStore {
        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(&Certificate(
                attestor_server_fixture_certs::CA_CERT_DER.to_vec(),
            ))
            .unwrap();
        roots
    }

    pub(crate) fn server_config() -> Arc<ServerConfig> {
        Arc::new(
            ServerConfig::builder()
                .with_safe_defaults()
                .with_no_client_auth()
                .with_single_cert(
                    vec![Certificate(
                        attestor_server_fixture_certs::SERVER_CERT_DER.to_vec(),
                    )],
                    PrivateKey(attestor_server_fixture_certs::SERVER_KEY_DER.to_vec()),
                )
                .unwrap(),
        )
    }

    /// Runs a whole connection in memory: the client sends `request`, the
    /// server answers with `response` and both close.
    pub(crate) fn run(
        version: &'static rustls::SupportedProtocolVersion,
        request: &[u8],
        response: &[u8],
    ) -> (Transcript, Arc<SecretLog>) {
        let secrets = Arc::new(SecretLog::new());
        let mut config = ClientConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&[version])
            .unwrap()
            .with_root_certificates(root_store())
            .with_no_client_auth();
        config.key_log = secrets.clone();

        let mut client =
            ClientConnection::new(Arc::new(config), "localhost".try_into().unwrap()).unwrap();
        let mut server = ServerConnection::new(server_config()).unwrap();

        let mut transcript = Transcript::new();
        let (mut client_records, mut server_records) = (RecordSplitter::new(), RecordSplitter::new());
        let mut record = |sender: Sender, data: &[u8], transcript: &mut Transcript| {
            let splitter = match sender {
                Sender::Client => &mut client_records,
                Sender::Server => &mut server_records,
            };
            splitter.push(data);
            while let Some(bytes) = splitter.next_record_bytes().unwrap() {
                transcript.push(sender, bytes);
            }
        };

        let mut pump = |client: &mut ClientConnection,
                        server: &mut ServerConnection,
                        transcript: &mut Transcript| {
            loop {
                let mut progressed = false;

                let mut buf = Vec::new();
                while client.wants_write() {
                    client.write_tls(&mut buf).unwrap();
                }
                if !buf.is_empty() {
                    progressed = true;
                    record(Sender::Client, &buf, transcript);
                    let mut rd = buf.as_slice();
                    while !rd.is_empty() {
                        server.read_tls(&mut rd).unwrap();
                        server.process_new_packets().unwrap();
                    }
                }

                let mut buf = Vec::new();
                while server.wants_write() {
                    server.write_tls(&mut buf).unwrap();
                }
                if !buf.is_empty() {
                    progressed = true;
                    record(Sender::Server, &buf, transcript);
                    let mut rd = buf.as_slice();
                    while !rd.is_empty() {
                        client.read_tls(&mut rd).unwrap();
                        client.process_new_packets().unwrap();
                    }
                }

                if !progressed {
                    break;
                }
            }
        };

        client.writer().write_all(request).unwrap();
        pump(&mut client, &mut server, &mut transcript);

        let mut received = vec![0u8; request.len()];
        server.reader().read_exact(&mut received).unwrap();
        assert_eq!(received, request);

        server.writer().write_all(response).unwrap();
        server.send_close_notify();
        client.send_close_notify();
        pump(&mut client, &mut server, &mut transcript);

        (transcript, secrets)
    }
}

#[cfg(test)]
mod test {
    use super::{test_utils::run, *};
    use rstest::rstest;
    use tls_core::{reconstruct, CertificateDer, RootCertStore, ServerCertVerifier, TranscriptRecord};

    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
    const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    const NOW: u64 = 1_800_000_000;

    fn verifier() -> ServerCertVerifier {
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(
            attestor_server_fixture_certs::CA_CERT_DER.to_vec(),
        ));
        ServerCertVerifier::new(&roots).unwrap()
    }

    fn replay(messages: &[ClaimTranscriptMessage]) -> tls_core::HandshakeSummary {
        let records: Vec<TranscriptRecord> = messages
            .iter()
            .map(|msg| TranscriptRecord {
                sender: msg.sender,
                record: TlsRecord::parse(&msg.message).unwrap(),
                key: msg.reveal.clone(),
            })
            .collect();
        reconstruct(&records, &verifier(), NOW).unwrap()
    }

    #[rstest]
    #[case::tls13(&rustls::version::TLS13, TlsVersion::V1_3)]
    #[case::tls12(&rustls::version::TLS12, TlsVersion::V1_2)]
    fn test_reveal_all(
        #[case] version: &'static rustls::SupportedProtocolVersion,
        #[case] expected: TlsVersion,
    ) {
        let (transcript, secrets) = run(version, REQUEST, RESPONSE);

        let messages = reveal_records(&transcript, &secrets, &RevealPolicy::All).unwrap();
        assert_eq!(messages.len(), transcript.len());

        let summary = replay(&messages);
        assert_eq!(summary.version, expected);
        assert_eq!(summary.server_name, "localhost");
        assert_eq!(summary.revealed_plaintext(Sender::Client), REQUEST);
        assert_eq!(summary.revealed_plaintext(Sender::Server), RESPONSE);
    }

    #[rstest]
    #[case::tls13(&rustls::version::TLS13)]
    #[case::tls12(&rustls::version::TLS12)]
    fn test_reveal_handshake_only(#[case] version: &'static rustls::SupportedProtocolVersion) {
        let (transcript, secrets) = run(version, REQUEST, RESPONSE);

        let messages = reveal_records(&transcript, &secrets, &RevealPolicy::HandshakeOnly).unwrap();

        let summary = replay(&messages);
        assert!(summary.revealed_plaintext(Sender::Client).is_empty());
        assert!(summary.revealed_plaintext(Sender::Server).is_empty());
        assert!(summary
            .application_data
            .iter()
            .any(|record| record.plaintext.is_none()));
    }

    #[test]
    fn test_reveal_custom() {
        let (transcript, secrets) = run(&rustls::version::TLS13, REQUEST, RESPONSE);
        let policy = RevealPolicy::custom(|sender, _| sender == Sender::Server);

        let messages = reveal_records(&transcript, &secrets, &policy).unwrap();

        let summary = replay(&messages);
        assert!(summary.revealed_plaintext(Sender::Client).is_empty());
        assert_eq!(summary.revealed_plaintext(Sender::Server), RESPONSE);
    }

    #[test]
    fn test_missing_secret() {
        let (transcript, _) = run(&rustls::version::TLS13, REQUEST, RESPONSE);

        let err = reveal_records(&transcript, &SecretLog::new(), &RevealPolicy::All).unwrap_err();
        assert!(matches!(
            err,
            RevealError::MissingSecret(CLIENT_HANDSHAKE_TRAFFIC_SECRET)
        ));
    }
}

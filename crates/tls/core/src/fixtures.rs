//! Captured TLS streams with a server using the `localhost` certificate
//! fixture.
//!
//! Each line of a transcript file is `<c|s> <record hex>` optionally followed
//! by `<key hex> <iv hex> <seq>` for revealed records.

use crate::{
    cipher::RecordKey,
    reconstruct::TranscriptRecord,
    record::{Sender, TlsRecord},
};

/// A time at which the fixture certificates are valid.
pub(crate) const FIXTURE_TIME: u64 = 1_800_000_000;

/// TLS 1.3 with TLS_AES_256_GCM_SHA384, every record revealed.
pub(crate) fn tls13() -> Vec<TranscriptRecord> {
    parse(include_str!("fixtures/data/localhost/tls13.transcript"))
}

/// TLS 1.2 with ECDHE-ECDSA-AES128-GCM-SHA256, every record revealed.
pub(crate) fn tls12() -> Vec<TranscriptRecord> {
    parse(include_str!("fixtures/data/localhost/tls12.transcript"))
}

fn parse(data: &str) -> Vec<TranscriptRecord> {
    data.lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let sender = match parts[0] {
                "c" => Sender::Client,
                "s" => Sender::Server,
                other => panic!("unknown sender {other}"),
            };
            let record = TlsRecord::parse(&hex::decode(parts[1]).unwrap()).unwrap();
            let key = (parts.len() == 5).then(|| RecordKey {
                key: hex::decode(parts[2]).unwrap(),
                iv: hex::decode(parts[3]).unwrap(),
                seq: parts[4].parse().unwrap(),
            });

            TranscriptRecord {
                sender,
                record,
                key,
            }
        })
        .collect()
}

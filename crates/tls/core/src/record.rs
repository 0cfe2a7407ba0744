//! TLS record framing.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::enums::ContentType;

/// Length of a record header.
pub const HEADER_LEN: usize = 5;

/// Largest payload a record may carry, ciphertext expansion included.
pub const MAX_PAYLOAD_LEN: usize = 16384 + 2048;

/// The party which sent a piece of a TLS stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Sender {
    /// The TLS client.
    Client,
    /// The TLS server.
    Server,
}

impl Sender {
    /// Returns the opposite party.
    pub fn peer(self) -> Self {
        match self {
            Sender::Client => Sender::Server,
            Sender::Server => Sender::Client,
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::Client => write!(f, "client"),
            Sender::Server => write!(f, "server"),
        }
    }
}

/// Errors that can occur while framing records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[allow(missing_docs)]
pub enum RecordError {
    #[error("unknown record content type: {0}")]
    UnknownContentType(u8),
    #[error("record payload of {0} bytes exceeds the maximum length")]
    TooLarge(usize),
    #[error("record is truncated")]
    Truncated,
    #[error("expected exactly one record, found {0} trailing bytes")]
    TrailingData(usize),
}

/// A single TLS record as it appeared on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsRecord {
    /// Record content type.
    pub content_type: ContentType,
    /// Legacy record version.
    pub version: u16,
    /// Record payload, encrypted or not.
    pub payload: Vec<u8>,
}

impl TlsRecord {
    /// Parses a record from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold a complete record,
    /// otherwise the record and the number of bytes it occupied.
    pub fn parse_prefix(buf: &[u8]) -> Result<Option<(Self, usize)>, RecordError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let content_type =
            ContentType::from_u8(buf[0]).ok_or(RecordError::UnknownContentType(buf[0]))?;

        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let version = u16::from_be_bytes([buf[1], buf[2]]);
        let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(RecordError::TooLarge(len));
        }

        let total = HEADER_LEN + len;
        if buf.len() < total {
            return Ok(None);
        }

        Ok(Some((
            Self {
                content_type,
                version,
                payload: buf[HEADER_LEN..total].to_vec(),
            },
            total,
        )))
    }

    /// Parses `buf`, which must contain exactly one record.
    pub fn parse(buf: &[u8]) -> Result<Self, RecordError> {
        match Self::parse_prefix(buf)? {
            Some((record, used)) if used == buf.len() => Ok(record),
            Some((_, used)) => Err(RecordError::TrailingData(buf.len() - used)),
            None => Err(RecordError::Truncated),
        }
    }

    /// Returns the 5 byte record header.
    pub fn header(&self) -> [u8; HEADER_LEN] {
        let [v0, v1] = self.version.to_be_bytes();
        let [l0, l1] = (self.payload.len() as u16).to_be_bytes();
        [self.content_type.as_u8(), v0, v1, l0, l1]
    }

    /// Serializes the record back to its wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header());
        out.extend_from_slice(&self.payload);
        out
    }
}

impl fmt::Debug for TlsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsRecord")
            .field("content_type", &self.content_type)
            .field("version", &format_args!("{:#06x}", self.version))
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Splits a byte stream into whole records.
///
/// Bytes are pushed as they arrive and complete records are pulled out,
/// partial records stay buffered until the rest arrives.
#[derive(Debug, Default)]
pub struct RecordSplitter {
    buf: Vec<u8>,
}

impl RecordSplitter {
    /// Creates an empty splitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes to the internal buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pops the next complete record, if any.
    pub fn next_record(&mut self) -> Result<Option<TlsRecord>, RecordError> {
        match TlsRecord::parse_prefix(&self.buf)? {
            Some((record, used)) => {
                self.buf.drain(..used);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Pops the raw bytes of the next complete record, if any.
    pub fn next_record_bytes(&mut self) -> Result<Option<Vec<u8>>, RecordError> {
        match TlsRecord::parse_prefix(&self.buf)? {
            Some((_, used)) => Ok(Some(self.buf.drain(..used).collect())),
            None => Ok(None),
        }
    }

    /// Returns the number of buffered bytes not yet forming a record.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

//! Directional byte transcripts recorded on a tunnel.

use serde::{Deserialize, Serialize};

use crate::Sender;

/// One chunk of a [`Transcript`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry<M = ()> {
    /// Who sent the bytes.
    pub sender: Sender,
    /// The bytes.
    pub data: Vec<u8>,
    /// Additional data the recorder attached to the chunk.
    pub meta: M,
}

/// An append-only, ordered record of the bytes exchanged on a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript<M = ()> {
    entries: Vec<TranscriptEntry<M>>,
}

impl<M> Default for Transcript<M> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<M> Transcript<M> {
    /// Creates an empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk.
    pub fn append(&mut self, sender: Sender, data: impl Into<Vec<u8>>, meta: M) {
        self.entries.push(TranscriptEntry {
            sender,
            data: data.into(),
            meta,
        });
    }

    /// Returns the recorded chunks in order.
    pub fn entries(&self) -> &[TranscriptEntry<M>] {
        &self.entries
    }

    /// Returns an iterator over the recorded chunks.
    pub fn iter(&self) -> impl Iterator<Item = &TranscriptEntry<M>> {
        self.entries.iter()
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns all bytes sent by `sender`, concatenated in order.
    pub fn concat(&self, sender: Sender) -> Vec<u8> {
        self.entries
            .iter()
            .filter(|entry| entry.sender == sender)
            .flat_map(|entry| entry.data.iter().copied())
            .collect()
    }

    /// Returns the transcript with metadata stripped.
    pub fn to_plain(&self) -> Transcript {
        Transcript {
            entries: self
                .entries
                .iter()
                .map(|entry| TranscriptEntry {
                    sender: entry.sender,
                    data: entry.data.clone(),
                    meta: (),
                })
                .collect(),
        }
    }
}

impl Transcript {
    /// Appends a chunk without metadata.
    pub fn push(&mut self, sender: Sender, data: impl Into<Vec<u8>>) {
        self.append(sender, data, ());
    }
}

impl<M> IntoIterator for Transcript<M> {
    type Item = TranscriptEntry<M>;
    type IntoIter = std::vec::IntoIter<TranscriptEntry<M>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

//! Claims and their canonical encoding.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::{RecordKey, Sender};

/// Epoch of the attestor set. A single attestor always signs in epoch 1.
pub const DEFAULT_EPOCH: u32 = 1;

/// What a claim is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimInfo {
    /// Name of the provider which validates the claim.
    pub provider: String,
    /// Provider parameters, JSON encoded.
    pub parameters: String,
    /// Free-form context, JSON encoded.
    pub context: String,
}

impl ClaimInfo {
    /// Returns the identifier of the claim, `0x` followed by the hex encoded
    /// Keccak-256 hash of the newline separated fields.
    pub fn identifier(&self) -> String {
        let mut hasher = Keccak256::new();
        hasher.update(self.provider.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.parameters.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.context.as_bytes());
        format!("0x{}", hex::encode(hasher.finalize()))
    }
}

/// The claim data a client submits.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClaimRequestData {
    /// Provider name.
    pub provider: String,
    /// Provider parameters, JSON encoded.
    pub parameters: String,
    /// Address of the claim owner.
    pub owner: String,
    /// Unix time the claim was created at.
    pub timestamp_s: u64,
    /// Free-form context, JSON encoded.
    pub context: String,
}

impl ClaimRequestData {
    /// Returns the claim info part of the request.
    pub fn info(&self) -> ClaimInfo {
        ClaimInfo {
            provider: self.provider.clone(),
            parameters: self.parameters.clone(),
            context: self.context.clone(),
        }
    }
}

/// A verified claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderClaimData {
    /// Provider name.
    pub provider: String,
    /// Provider parameters, JSON encoded.
    pub parameters: String,
    /// Address of the claim owner.
    pub owner: String,
    /// Unix time the claim was created at.
    pub timestamp_s: u64,
    /// Free-form context, JSON encoded.
    pub context: String,
    /// See [`ClaimInfo::identifier`].
    pub identifier: String,
    /// Epoch the claim was signed in.
    pub epoch: u32,
}

impl ProviderClaimData {
    /// Builds the claim for a validated request.
    ///
    /// `info` is the claim info as returned by the provider, which may have
    /// normalised the parameters or context.
    pub fn new(info: ClaimInfo, owner: &str, timestamp_s: u64, epoch: u32) -> Self {
        Self {
            identifier: info.identifier(),
            provider: info.provider,
            parameters: info.parameters,
            owner: owner.to_string(),
            timestamp_s,
            context: info.context,
            epoch,
        }
    }

    /// Returns the canonical encoding the attestor signs.
    pub fn sign_data(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n{}",
            self.identifier,
            self.owner.to_lowercase(),
            self.timestamp_s,
            self.epoch
        )
        .into_bytes()
    }
}

/// One TLS record of a claimed transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTranscriptMessage {
    /// Who sent the record.
    pub sender: Sender,
    /// The raw record, header included.
    pub message: Vec<u8>,
    /// The key of the record, if revealed.
    pub reveal: Option<RecordKey>,
}

/// Signatures made by the claim owner.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClaimRequestSignatures {
    /// Owner signature over the request without signatures.
    pub request_signature: Vec<u8>,
}

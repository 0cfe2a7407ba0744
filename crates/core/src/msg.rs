//! Message types of the attestor protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthenticationRequest,
    claim::{ClaimRequestData, ClaimRequestSignatures, ClaimTranscriptMessage, ProviderClaimData},
    codec::{to_bytes, CodecError},
    error::RpcError,
    signing::SignatureType,
};

/// A message of the attestor protocol.
///
/// Ids are chosen by the sender of a request and are unique among its
/// outstanding requests. Responses reuse the id of the request they answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcMessage {
    /// Message id.
    pub id: u32,
    /// Message payload.
    pub payload: Payload,
}

/// Payload of a [`RpcMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// A request.
    Request(RpcRequest),
    /// A successful response.
    Response(RpcResponse),
    /// A failed response.
    Error(RpcError),
    /// Bytes relayed through a tunnel.
    TunnelMessage(TunnelMessage),
    /// A tunnel was closed.
    TunnelDisconnectEvent(TunnelDisconnectEvent),
    /// The sender is closing the connection.
    ConnectionTerminationAlert(RpcError),
}

/// The RPCs of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum RpcType {
    Init,
    CreateTunnel,
    DisconnectTunnel,
    ClaimTunnel,
    ClaimTeeBundle,
    CreateClaimOnChain,
    CompleteClaimOnChain,
}

impl fmt::Display for RpcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcType::Init => "init",
            RpcType::CreateTunnel => "createTunnel",
            RpcType::DisconnectTunnel => "disconnectTunnel",
            RpcType::ClaimTunnel => "claimTunnel",
            RpcType::ClaimTeeBundle => "claimTeeBundle",
            RpcType::CreateClaimOnChain => "createClaimOnChain",
            RpcType::CompleteClaimOnChain => "completeClaimOnChain",
        };
        f.write_str(name)
    }
}

/// A request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum RpcRequest {
    Init(InitRequest),
    CreateTunnel(CreateTunnelRequest),
    DisconnectTunnel(DisconnectTunnelRequest),
    ClaimTunnel(ClaimTunnelRequest),
    ClaimTeeBundle(ClaimTeeBundleRequest),
    CreateClaimOnChain(ChainRequest),
    CompleteClaimOnChain(ChainRequest),
}

impl RpcRequest {
    /// Returns the RPC this request belongs to.
    pub fn rpc_type(&self) -> RpcType {
        match self {
            RpcRequest::Init(_) => RpcType::Init,
            RpcRequest::CreateTunnel(_) => RpcType::CreateTunnel,
            RpcRequest::DisconnectTunnel(_) => RpcType::DisconnectTunnel,
            RpcRequest::ClaimTunnel(_) => RpcType::ClaimTunnel,
            RpcRequest::ClaimTeeBundle(_) => RpcType::ClaimTeeBundle,
            RpcRequest::CreateClaimOnChain(_) => RpcType::CreateClaimOnChain,
            RpcRequest::CompleteClaimOnChain(_) => RpcType::CompleteClaimOnChain,
        }
    }
}

/// A successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum RpcResponse {
    Init(InitResponse),
    CreateTunnel(CreateTunnelResponse),
    DisconnectTunnel(DisconnectTunnelResponse),
    ClaimTunnel(Box<ClaimTunnelResponse>),
    ClaimTeeBundle(Box<ClaimTeeBundleResponse>),
    CreateClaimOnChain(ChainResponse),
    CompleteClaimOnChain(ChainResponse),
}

impl RpcResponse {
    /// Returns the RPC this response belongs to.
    pub fn rpc_type(&self) -> RpcType {
        match self {
            RpcResponse::Init(_) => RpcType::Init,
            RpcResponse::CreateTunnel(_) => RpcType::CreateTunnel,
            RpcResponse::DisconnectTunnel(_) => RpcType::DisconnectTunnel,
            RpcResponse::ClaimTunnel(_) => RpcType::ClaimTunnel,
            RpcResponse::ClaimTeeBundle(_) => RpcType::ClaimTeeBundle,
            RpcResponse::CreateClaimOnChain(_) => RpcType::CreateClaimOnChain,
            RpcResponse::CompleteClaimOnChain(_) => RpcType::CompleteClaimOnChain,
        }
    }
}

/// First request on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    /// Protocol version of the client.
    pub client_version: u32,
    /// Signature scheme the client wants claims signed with.
    pub signature_type: SignatureType,
    /// Optional authentication token.
    pub auth: Option<AuthenticationRequest>,
}

/// Response to [`InitRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InitResponse {}

/// Opens a tunnel to `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    /// Tunnel id, chosen by the client.
    pub id: u32,
    /// Target host.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// ISO 3166-1 alpha-2 country to connect from, if any.
    pub geo_location: Option<String>,
}

/// Response to [`CreateTunnelRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateTunnelResponse {}

/// Closes a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectTunnelRequest {
    /// Tunnel id.
    pub id: u32,
}

/// Response to [`DisconnectTunnelRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DisconnectTunnelResponse {}

/// Bytes relayed through a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMessage {
    /// Tunnel id.
    pub tunnel_id: u32,
    /// Relayed bytes.
    pub message: Vec<u8>,
}

/// Notification that a tunnel was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDisconnectEvent {
    /// Tunnel id.
    pub tunnel_id: u32,
    /// Why the tunnel closed, `None` for a clean close.
    pub error: Option<RpcError>,
}

/// Asks the attestor to verify and sign a claim about a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTunnelRequest {
    /// The request the tunnel was created with.
    pub request: CreateTunnelRequest,
    /// What is being claimed.
    pub data: ClaimRequestData,
    /// The TLS records exchanged over the tunnel.
    pub transcript: Vec<ClaimTranscriptMessage>,
    /// Signatures of the claim owner.
    pub signatures: ClaimRequestSignatures,
}

impl ClaimTunnelRequest {
    /// Returns the bytes the owner signs: the request without signatures.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut unsigned = self.clone();
        unsigned.signatures = ClaimRequestSignatures::default();
        to_bytes(&unsigned)
    }
}

/// Signatures made by the attestor over a claim result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResultSignatures {
    /// Address of the attestor which signed.
    pub attestor_address: String,
    /// Signature over the canonical claim encoding, empty on failure.
    pub claim_signature: Vec<u8>,
    /// Signature over the encoded response without signatures.
    pub result_signature: Vec<u8>,
}

/// Response to [`ClaimTunnelRequest`].
///
/// Exactly one of `claim` and `error` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTunnelResponse {
    /// Echo of the request.
    pub request: ClaimTunnelRequest,
    /// The verified claim.
    pub claim: Option<ProviderClaimData>,
    /// Why the claim was rejected.
    pub error: Option<RpcError>,
    /// Attestor signatures.
    pub signatures: Option<ClaimResultSignatures>,
}

impl ClaimTunnelResponse {
    /// Returns the bytes covered by the result signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut unsigned = self.clone();
        unsigned.signatures = None;
        to_bytes(&unsigned)
    }
}

/// A transcript reconstructed inside an attested execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeeBundle {
    /// The tunnel the transcript was captured on.
    pub request: CreateTunnelRequest,
    /// Opaque transcript data, interpreted by the bundle verifier.
    pub transcript: Vec<u8>,
    /// Attestations over `transcript`.
    pub attestations: Vec<Vec<u8>>,
}

/// Asks the attestor to verify and sign a claim backed by a [`TeeBundle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTeeBundleRequest {
    /// The attested transcript.
    pub bundle: TeeBundle,
    /// What is being claimed.
    pub data: ClaimRequestData,
    /// Signatures of the claim owner.
    pub signatures: ClaimRequestSignatures,
}

impl ClaimTeeBundleRequest {
    /// Returns the bytes the owner signs: the request without signatures.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut unsigned = self.clone();
        unsigned.signatures = ClaimRequestSignatures::default();
        to_bytes(&unsigned)
    }
}

/// Response to [`ClaimTeeBundleRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTeeBundleResponse {
    /// The verified claim.
    pub claim: Option<ProviderClaimData>,
    /// Why the claim was rejected.
    pub error: Option<RpcError>,
    /// Attestor signatures.
    pub signatures: Option<ClaimResultSignatures>,
}

impl ClaimTeeBundleResponse {
    /// Returns the bytes covered by the result signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut unsigned = self.clone();
        unsigned.signatures = None;
        to_bytes(&unsigned)
    }
}

/// Opaque on-chain claim payment request, JSON encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRequest {
    /// JSON payload.
    pub payload: String,
}

/// Opaque on-chain claim payment response, JSON encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainResponse {
    /// JSON payload.
    pub payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sender;

    fn claim_request() -> ClaimTunnelRequest {
        ClaimTunnelRequest {
            request: CreateTunnelRequest {
                id: 1,
                host: "example.com".to_string(),
                port: 443,
                geo_location: None,
            },
            data: ClaimRequestData {
                provider: "http".to_string(),
                parameters: "{}".to_string(),
                owner: "0xabc".to_string(),
                timestamp_s: 1_700_000_000,
                context: String::new(),
            },
            transcript: vec![ClaimTranscriptMessage {
                sender: Sender::Client,
                message: vec![22, 3, 1, 0, 0],
                reveal: None,
            }],
            signatures: ClaimRequestSignatures {
                request_signature: vec![1, 2, 3],
            },
        }
    }

    #[test]
    fn test_signing_bytes_ignore_signatures() {
        let a = claim_request();
        let mut b = a.clone();
        b.signatures.request_signature = vec![9; 65];

        assert_eq!(a.signing_bytes().unwrap(), b.signing_bytes().unwrap());
    }

    #[test]
    fn test_signing_bytes_cover_transcript() {
        let a = claim_request();
        let mut b = a.clone();
        b.transcript[0].message[0] = 23;

        assert_ne!(a.signing_bytes().unwrap(), b.signing_bytes().unwrap());
    }

    #[test]
    fn test_rpc_type() {
        let req = RpcRequest::DisconnectTunnel(DisconnectTunnelRequest { id: 1 });
        assert_eq!(req.rpc_type(), RpcType::DisconnectTunnel);
        assert_eq!(req.rpc_type().to_string(), "disconnectTunnel");
    }
}

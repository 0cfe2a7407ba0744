//! Binary encoding of protocol messages.
//!
//! Every transport frame carries one [`RpcMessages`] batch. The same encoding
//! is used whenever a structure has to be signed.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::msg::RpcMessage;

/// Largest frame accepted by [`decode_batch`].
pub const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

/// Error for the message codec.
#[derive(Debug, thiserror::Error)]
#[error("codec error: {0}")]
pub struct CodecError(#[from] bincode::Error);

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_LEN)
}

/// Serializes `value` with the protocol encoding.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(options().serialize(value)?)
}

/// Deserializes a value encoded with [`to_bytes`].
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(options().deserialize(bytes)?)
}

/// A batch of messages sent in one transport frame.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RpcMessages {
    /// The messages, processed in order.
    pub messages: Vec<RpcMessage>,
}

/// Encodes a batch of messages into a frame.
pub fn encode_batch(messages: &[RpcMessage]) -> Result<Vec<u8>, CodecError> {
    #[derive(Serialize)]
    struct Batch<'a> {
        messages: &'a [RpcMessage],
    }

    to_bytes(&Batch { messages })
}

/// Decodes a frame into its batch of messages.
pub fn decode_batch(frame: &[u8]) -> Result<Vec<RpcMessage>, CodecError> {
    from_bytes::<RpcMessages>(frame).map(|batch| batch.messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::RpcError,
        msg::{CreateTunnelRequest, InitRequest, Payload, RpcRequest, TunnelMessage},
        signing::SignatureType,
    };

    fn batch() -> Vec<RpcMessage> {
        vec![
            RpcMessage {
                id: 1,
                payload: Payload::Request(RpcRequest::Init(InitRequest {
                    client_version: 4,
                    signature_type: SignatureType::Secp256k1Eth,
                    auth: None,
                })),
            },
            RpcMessage {
                id: 2,
                payload: Payload::Request(RpcRequest::CreateTunnel(CreateTunnelRequest {
                    id: 7,
                    host: "localhost".to_string(),
                    port: 443,
                    geo_location: Some("US".to_string()),
                })),
            },
            RpcMessage {
                id: 3,
                payload: Payload::TunnelMessage(TunnelMessage {
                    tunnel_id: 7,
                    message: b"\x16\x03\x01".to_vec(),
                }),
            },
            RpcMessage {
                id: 4,
                payload: Payload::Error(RpcError::bad_request("nope").with_data("{\"a\":1}")),
            },
        ]
    }

    #[test]
    fn test_batch_roundtrip() {
        let messages = batch();
        let frame = encode_batch(&messages).unwrap();

        assert_eq!(decode_batch(&frame).unwrap(), messages);
    }

    #[test]
    fn test_batch_and_struct_encodings_agree() {
        let messages = batch();
        let frame = encode_batch(&messages).unwrap();

        assert_eq!(frame, to_bytes(&RpcMessages { messages }).unwrap());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode_batch(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut frame = encode_batch(&batch()).unwrap();
        frame.push(0);

        assert!(decode_batch(&frame).is_err());
    }
}

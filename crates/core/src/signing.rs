//! Signature schemes used to sign claims and authenticate owners.

use std::fmt;

use k256::{
    ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use zeroize::Zeroizing;

/// Length of a recoverable secp256k1 signature, `r || s || v`.
pub const SECP256K1_SIGNATURE_LEN: usize = 65;

/// The signature schemes an attestor can sign with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SignatureType {
    /// Ethereum personal-message signatures over secp256k1.
    #[default]
    Secp256k1Eth,
}

impl SignatureType {
    /// Returns the implementation of the scheme.
    pub fn scheme(&self) -> &'static dyn SignatureScheme {
        match self {
            SignatureType::Secp256k1Eth => &Secp256k1Eth,
        }
    }
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureType::Secp256k1Eth => f.write_str("secp256k1-eth"),
        }
    }
}

/// A signature scheme.
///
/// Keys are passed around as raw bytes so callers do not depend on the curve
/// library of a particular scheme.
pub trait SignatureScheme: Send + Sync {
    /// Returns the public key of `private_key`.
    fn public_key(&self, private_key: &[u8]) -> Result<Vec<u8>, SignatureError>;

    /// Returns the address which identifies `public_key`.
    fn address(&self, public_key: &[u8]) -> Result<String, SignatureError>;

    /// Signs `data` with `private_key`.
    fn sign(&self, data: &[u8], private_key: &[u8]) -> Result<Vec<u8>, SignatureError>;

    /// Returns `true` if `signature` over `data` was made by the key behind
    /// `address`.
    fn verify(&self, data: &[u8], signature: &[u8], address: &str) -> Result<bool, SignatureError>;
}

/// Ethereum personal-message signing over secp256k1.
#[derive(Debug, Clone, Copy, Default)]
pub struct Secp256k1Eth;

impl Secp256k1Eth {
    /// Hashes `data` the way `personal_sign` does.
    pub fn message_hash(data: &[u8]) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(b"\x19Ethereum Signed Message:\n");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update(data);
        hasher.finalize().into()
    }

    /// Recovers the address which produced `signature` over `data`.
    pub fn recover_address(data: &[u8], signature: &[u8]) -> Result<String, SignatureError> {
        if signature.len() != SECP256K1_SIGNATURE_LEN {
            return Err(SignatureError::InvalidSignature);
        }

        let sig = Signature::from_slice(&signature[..64])
            .map_err(|_| SignatureError::InvalidSignature)?;
        let v = signature[64];
        let recid = RecoveryId::from_byte(if v >= 27 { v - 27 } else { v })
            .ok_or(SignatureError::InvalidSignature)?;

        let key = VerifyingKey::recover_from_prehash(&Self::message_hash(data), &sig, recid)
            .map_err(|_| SignatureError::InvalidSignature)?;

        Ok(address_of(&key))
    }
}

fn signing_key(private_key: &[u8]) -> Result<SigningKey, SignatureError> {
    SigningKey::from_slice(private_key).map_err(|_| SignatureError::InvalidPrivateKey)
}

fn address_of(key: &VerifyingKey) -> String {
    let point = key.as_affine().to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

impl SignatureScheme for Secp256k1Eth {
    fn public_key(&self, private_key: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let key = signing_key(private_key)?;
        Ok(key
            .verifying_key()
            .as_affine()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec())
    }

    fn address(&self, public_key: &[u8]) -> Result<String, SignatureError> {
        let key =
            VerifyingKey::from_sec1_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
        Ok(address_of(&key))
    }

    fn sign(&self, data: &[u8], private_key: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let key = signing_key(private_key)?;
        let (sig, recid) = key
            .sign_prehash_recoverable(&Self::message_hash(data))
            .map_err(|_| SignatureError::SigningFailed)?;

        let mut out = sig.to_bytes().to_vec();
        out.push(27 + recid.to_byte());
        Ok(out)
    }

    fn verify(&self, data: &[u8], signature: &[u8], address: &str) -> Result<bool, SignatureError> {
        let recovered = Self::recover_address(data, signature)?;
        Ok(recovered.eq_ignore_ascii_case(address))
    }
}

/// A private key together with the scheme it is used with.
pub struct KeyPair {
    signature_type: SignatureType,
    private_key: Zeroizing<Vec<u8>>,
    public_key: Vec<u8>,
    address: String,
}

opaque_debug::implement!(KeyPair);

impl KeyPair {
    /// Creates a key pair from raw private key bytes.
    pub fn from_private_key(
        signature_type: SignatureType,
        private_key: &[u8],
    ) -> Result<Self, SignatureError> {
        let scheme = signature_type.scheme();
        let public_key = scheme.public_key(private_key)?;
        let address = scheme.address(&public_key)?;

        Ok(Self {
            signature_type,
            private_key: Zeroizing::new(private_key.to_vec()),
            public_key,
            address,
        })
    }

    /// Generates a random key pair.
    pub fn random(signature_type: SignatureType) -> Self {
        let key = match signature_type {
            SignatureType::Secp256k1Eth => SigningKey::random(&mut OsRng),
        };
        let private_key = Zeroizing::new(key.to_bytes().to_vec());
        let public_key = key
            .verifying_key()
            .as_affine()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        let address = address_of(key.verifying_key());

        Self {
            signature_type,
            private_key,
            public_key,
            address,
        }
    }

    /// Returns the scheme of the key.
    pub fn signature_type(&self) -> SignatureType {
        self.signature_type
    }

    /// Returns the encoded public key.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Returns the address of the key.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Signs `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SignatureError> {
        self.signature_type.scheme().sign(data, &self.private_key)
    }
}

/// Error for signature schemes.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// The private key is malformed.
    #[error("invalid private key")]
    InvalidPrivateKey,
    /// The public key is malformed.
    #[error("invalid public key")]
    InvalidPublicKey,
    /// The signature is malformed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Signing failed.
    #[error("failed to sign")]
    SigningFailed,
}

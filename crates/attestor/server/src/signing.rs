use attestor_core::signing::{KeyPair, SignatureType};
use eyre::{eyre, Result};
use k256::{elliptic_curve::sec1::ToEncodedPoint, pkcs8::AssociatedOid};
use pkcs8::{DecodePrivateKey, ObjectIdentifier, PrivateKeyInfo, SecretDocument};
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{debug, error, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::config::AttestationProperties;

const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

/// Parses a PKCS#8 PEM encoded secp256k1 key.
pub fn key_from_pkcs8_pem(pem: &str) -> Result<KeyPair> {
    let (_, document) =
        SecretDocument::from_pem(pem).map_err(|err| eyre!("Invalid PEM document: {err}"))?;
    let info = PrivateKeyInfo::try_from(document.as_bytes())
        .map_err(|err| eyre!("Invalid PKCS#8 private key: {err}"))?;

    // For now we only support secp256k1 keys
    if info.algorithm.oid != OID_EC_PUBLIC_KEY {
        error!("unsupported key algorithm OID: {:?}", info.algorithm.oid);
        return Err(eyre!("Unsupported key algorithm"));
    }
    let curve = info
        .algorithm
        .parameters_oid()
        .map_err(|err| eyre!("Missing curve parameters: {err}"))?;
    if curve != k256::Secp256k1::OID {
        error!("unsupported curve OID: {:?}", curve);
        return Err(eyre!("Unsupported curve, expected secp256k1"));
    }

    let key = k256::ecdsa::SigningKey::from_pkcs8_der(document.as_bytes())
        .map_err(|err| eyre!("Malformed secp256k1 key: {err}"))?;
    let bytes = Zeroizing::new(key.to_bytes().to_vec());

    KeyPair::from_private_key(SignatureType::Secp256k1Eth, &bytes).map_err(|err| eyre!("Invalid secp256k1 key: {err}"))
}

/// Get the attestor signing key for claims.
/// Generate a random key if user does not provide a static key.
pub async fn get_attestor_key(config: &AttestationProperties) -> Result<KeyPair> {
    let key = if let Some(private_key_path) = &config.private_key_path {
        debug!("Loading attestor's signing key");

        let mut file = File::open(private_key_path).await?;
        let mut pem = String::new();
        file.read_to_string(&mut pem)
            .await
            .map_err(|_| eyre!("pem file does not contain valid UTF-8"))?;

        let key = key_from_pkcs8_pem(&pem)
            .map_err(|err| eyre!("Failed to load attestor signing key: {err}"))?;

        pem.zeroize();

        key
    } else {
        warn!(
            "⚠️ Using a random, ephemeral signing key because `attestation.private_key_path` is not set."
        );
        KeyPair::random(SignatureType::Secp256k1Eth)
    };

    Ok(key)
}

/// Returns the compressed SEC1 public key of `key`, hex encoded.
pub fn public_key_hex(key: &KeyPair) -> String {
    match k256::PublicKey::from_sec1_bytes(key.public_key()) {
        Ok(public_key) => hex::encode(public_key.to_encoded_point(true).as_bytes()),
        Err(_) => hex::encode(key.public_key()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_load_attestor_key() {
        let config = AttestationProperties {
            private_key_path: Some("./fixture/attestor/attestor.key".to_string()),
            ..Default::default()
        };
        let key = get_attestor_key(&config)
            .await
            .expect("Could not load attestor key");

        assert!(key.address().starts_with("0x"));
        assert_eq!(key.address().len(), 42);
        assert_eq!(public_key_hex(&key).len(), 66);
    }

    #[tokio::test]
    async fn test_generate_attestor_key() {
        let config = AttestationProperties {
            private_key_path: None,
            ..Default::default()
        };
        let result = get_attestor_key(&config).await;
        assert!(result.is_ok(), "Could not generate attestor key");
    }

    #[test]
    fn test_reject_non_pem() {
        assert!(key_from_pkcs8_pem("not a key").is_err());
    }
}

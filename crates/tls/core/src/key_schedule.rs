//! Traffic key derivation for TLS 1.2 and TLS 1.3.

use hmac::{digest::KeyInit, Mac};
use ring::{aead, hkdf};

use crate::suites::{HashAlgorithm, SuiteParams};

/// Error returned when key material has an invalid length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid key material length")]
pub struct InvalidKeyLength;

/// Fills the given buffer with the output of the TLS 1.2 PRF.
///
/// # Arguments
///
/// * `hash` - the PRF hash of the cipher suite.
/// * `out` - The buffer to fill with the output.
/// * `secret` - prf secret.
/// * `label` - prf label, e.g. "key expansion".
/// * `seed` - prf seed, e.g. server_random + client_random.
pub fn prf(
    hash: HashAlgorithm,
    out: &mut [u8],
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
) -> Result<(), InvalidKeyLength> {
    match hash {
        HashAlgorithm::Sha256 => p_hash::<hmac::Hmac<sha2::Sha256>>(out, secret, label, seed),
        HashAlgorithm::Sha384 => p_hash::<hmac::Hmac<sha2::Sha384>>(out, secret, label, seed),
    }
}

fn p_hash<M>(out: &mut [u8], secret: &[u8], label: &[u8], seed: &[u8]) -> Result<(), InvalidKeyLength>
where
    M: Mac + KeyInit + Clone,
{
    let keyed_hmac = <M as Mac>::new_from_slice(secret).map_err(|_| InvalidKeyLength)?;

    let mut current_a = keyed_hmac.clone();
    current_a.update(label);
    current_a.update(seed);

    let mut offset = 0;
    while offset < out.len() {
        let a = std::mem::replace(&mut current_a, keyed_hmac.clone())
            .finalize()
            .into_bytes();

        // P_hash[i] = HMAC_hash(secret, A(i) + seed)
        let mut p_term = keyed_hmac.clone();
        p_term.update(&a);
        p_term.update(label);
        p_term.update(seed);
        let block = p_term.finalize().into_bytes();

        let n = block.len().min(out.len() - offset);
        out[offset..offset + n].copy_from_slice(&block[..n]);
        offset += n;

        // A(i+1) = HMAC_hash(secret, A(i))
        current_a.update(&a);
    }

    Ok(())
}

/// Write keys of both parties for a TLS 1.2 connection.
#[derive(Clone, PartialEq, Eq)]
pub struct Tls12KeyBlock {
    /// Client write key.
    pub client_key: Vec<u8>,
    /// Client write IV.
    pub client_iv: Vec<u8>,
    /// Server write key.
    pub server_key: Vec<u8>,
    /// Server write IV.
    pub server_iv: Vec<u8>,
}

opaque_debug::implement!(Tls12KeyBlock);

/// Expands a TLS 1.2 master secret into the connection's write keys.
pub fn tls12_key_block(
    params: &SuiteParams,
    master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Result<Tls12KeyBlock, InvalidKeyLength> {
    let key_len = params.aead.key_len();
    let iv_len = params.aead.tls12_fixed_iv_len();

    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(server_random);
    seed[32..].copy_from_slice(client_random);

    let mut block = vec![0u8; 2 * (key_len + iv_len)];
    prf(params.hash, &mut block, master_secret, b"key expansion", &seed)?;

    let (client_key, rest) = block.split_at(key_len);
    let (server_key, rest) = rest.split_at(key_len);
    let (client_iv, server_iv) = rest.split_at(iv_len);

    Ok(Tls12KeyBlock {
        client_key: client_key.to_vec(),
        client_iv: client_iv.to_vec(),
        server_key: server_key.to_vec(),
        server_iv: server_iv.to_vec(),
    })
}

struct Len(usize);

impl hkdf::KeyType for Len {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label from RFC 8446 section 7.1.
pub fn hkdf_expand_label(
    hash: HashAlgorithm,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    len: usize,
) -> Result<Vec<u8>, InvalidKeyLength> {
    const LABEL_PREFIX: &[u8] = b"tls13 ";

    let output_len = u16::try_from(len).map_err(|_| InvalidKeyLength)?.to_be_bytes();
    let label_len = [(LABEL_PREFIX.len() + label.len()) as u8];
    let context_len = [context.len() as u8];

    let info = &[
        &output_len[..],
        &label_len[..],
        LABEL_PREFIX,
        label,
        &context_len[..],
        context,
    ];

    let prk = hkdf::Prk::new_less_safe(hash.hkdf(), secret);
    let okm = prk.expand(info, Len(len)).map_err(|_| InvalidKeyLength)?;

    let mut out = vec![0u8; len];
    okm.fill(&mut out).map_err(|_| InvalidKeyLength)?;
    Ok(out)
}

/// Derives the record key and IV from a TLS 1.3 traffic secret.
pub fn tls13_traffic_keys(
    params: &SuiteParams,
    traffic_secret: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), InvalidKeyLength> {
    let key = hkdf_expand_label(
        params.hash,
        traffic_secret,
        b"key",
        &[],
        params.aead.key_len(),
    )?;
    let iv = hkdf_expand_label(params.hash, traffic_secret, b"iv", &[], aead::NONCE_LEN)?;

    Ok((key, iv))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::CipherSuite;

    #[test]
    fn test_prf() {
        let secret = [42u8; 48];
        let seed = [69u8; 64];
        let label = b"master secret";

        let mut out = [0u8; 48];
        prf(HashAlgorithm::Sha256, &mut out, &secret, label, &seed).unwrap();

        let mut ring_out = [0u8; 48];
        ring_prf::prf(
            ring::hmac::HMAC_SHA256,
            &mut ring_out,
            &secret,
            label,
            &seed,
        );

        assert_eq!(out, ring_out);
    }

    #[test]
    fn test_prf_sha384() {
        let secret = [1u8; 48];
        let seed = [2u8; 64];

        let mut out = [0u8; 72];
        prf(HashAlgorithm::Sha384, &mut out, &secret, b"key expansion", &seed).unwrap();

        let mut ring_out = [0u8; 72];
        ring_prf::prf(
            ring::hmac::HMAC_SHA384,
            &mut ring_out,
            &secret,
            b"key expansion",
            &seed,
        );

        assert_eq!(out, ring_out);
    }

    #[test]
    fn test_tls12_key_block_split() {
        let params =
            SuiteParams::lookup(CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256).unwrap();
        let keys = tls12_key_block(&params, &[3u8; 48], &[4u8; 32], &[5u8; 32]).unwrap();

        let mut block = [0u8; 40];
        let mut seed = [5u8; 64];
        seed[32..].copy_from_slice(&[4u8; 32]);
        prf(HashAlgorithm::Sha256, &mut block, &[3u8; 48], b"key expansion", &seed).unwrap();

        assert_eq!(keys.client_key, &block[..16]);
        assert_eq!(keys.server_key, &block[16..32]);
        assert_eq!(keys.client_iv, &block[32..36]);
        assert_eq!(keys.server_iv, &block[36..40]);
    }

    // Server handshake traffic secret and derived keys from RFC 8448 section 3.
    #[test]
    fn test_tls13_traffic_keys_rfc8448() {
        let params = SuiteParams::lookup(CipherSuite::TLS13_AES_128_GCM_SHA256).unwrap();
        let secret =
            hex::decode("b67b7d690cc16c4e75e54213cb2d37b4e9c912bcded9105d42befd59d391ad38")
                .unwrap();

        let (key, iv) = tls13_traffic_keys(&params, &secret).unwrap();

        assert_eq!(hex::encode(key), "3fce516009c21727d0f2e4e86ee403bc");
        assert_eq!(hex::encode(iv), "5d313eb2671276ee13000b30");
    }

    // Borrowed from Rustls for testing
    // https://github.com/rustls/rustls/blob/main/rustls/src/tls12/prf.rs
    mod ring_prf {
        use ring::hmac;

        fn concat_sign(key: &hmac::Key, a: &[u8], b: &[u8]) -> hmac::Tag {
            let mut ctx = hmac::Context::with_key(key);
            ctx.update(a);
            ctx.update(b);
            ctx.sign()
        }

        fn p(out: &mut [u8], alg: hmac::Algorithm, secret: &[u8], seed: &[u8]) {
            let hmac_key = hmac::Key::new(alg, secret);

            // A(1)
            let mut current_a = hmac::sign(&hmac_key, seed);
            let chunk_size = alg.digest_algorithm().output_len();
            for chunk in out.chunks_mut(chunk_size) {
                // P_hash[i] = HMAC_hash(secret, A(i) + seed)
                let p_term = concat_sign(&hmac_key, current_a.as_ref(), seed);
                chunk.copy_from_slice(&p_term.as_ref()[..chunk.len()]);

                // A(i+1) = HMAC_hash(secret, A(i))
                current_a = hmac::sign(&hmac_key, current_a.as_ref());
            }
        }

        fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
            let mut ret = Vec::new();
            ret.extend_from_slice(a);
            ret.extend_from_slice(b);
            ret
        }

        pub(super) fn prf(
            alg: hmac::Algorithm,
            out: &mut [u8],
            secret: &[u8],
            label: &[u8],
            seed: &[u8],
        ) {
            let joined_seed = concat(label, seed);
            p(out, alg, secret, &joined_seed);
        }
    }
}

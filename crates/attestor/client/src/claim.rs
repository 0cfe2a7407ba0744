//! Claim construction and verification of the attestor's answer.

use attestor_core::{
    claim::{ClaimInfo, ClaimRequestData, ClaimRequestSignatures},
    msg::{
        ClaimResultSignatures, ClaimTeeBundleRequest, ClaimTeeBundleResponse, ClaimTunnelRequest,
        ClaimTunnelResponse, RpcRequest, RpcResponse, TeeBundle,
    },
    signing::{KeyPair, SignatureType},
    unix_time,
};
use tracing::{debug, info, instrument};

use crate::{
    client::AttestorClient,
    error::{ClientError, ErrorKind},
    reveal::{reveal_records, RevealPolicy},
    tls::TlsTunnel,
};

/// Claims what happened on `tls`.
///
/// Read everything the server sent before claiming: the attestor compares
/// the transcript against the bytes it relayed. The attestor takes the
/// tunnel over, it must not be used afterwards.
///
/// A response carrying an error is returned as `Ok`, the attestor signed it
/// all the same.
#[instrument(level = "debug", skip_all, fields(tunnel_id = tls.tunnel().id()), err)]
pub async fn claim_tunnel(
    client: &AttestorClient,
    tls: TlsTunnel,
    info: ClaimInfo,
    owner: &KeyPair,
    policy: &RevealPolicy,
) -> Result<ClaimTunnelResponse, ClientError> {
    let transcript = reveal_records(tls.transcript(), tls.secrets(), policy)
        .map_err(|err| ClientError::new(ErrorKind::Claim, Some(Box::new(err))))?;
    tls.tunnel().detach();

    let mut request = ClaimTunnelRequest {
        request: tls.tunnel().request().clone(),
        data: request_data(info, owner),
        transcript,
        signatures: ClaimRequestSignatures::default(),
    };
    request.signatures.request_signature = sign(owner, request.signing_bytes())?;

    let response = match client.request(RpcRequest::ClaimTunnel(request)).await? {
        RpcResponse::ClaimTunnel(response) => *response,
        other => return Err(unexpected(other)),
    };

    let signatures = response.signatures.as_ref().ok_or_else(|| {
        ClientError::msg(ErrorKind::Claim, "attestor did not sign the claim result")
    })?;
    verify_result(
        owner.signature_type(),
        signatures,
        response.signing_bytes(),
        response.claim.as_ref().map(|claim| claim.sign_data()),
    )?;

    match &response.error {
        Some(err) => info!(%err, "claim rejected"),
        None => info!(attestor = %signatures.attestor_address, "claim signed"),
    }
    Ok(response)
}

/// Claims the transcript of an attested execution environment.
#[instrument(level = "debug", skip_all, err)]
pub async fn claim_tee_bundle(
    client: &AttestorClient,
    bundle: TeeBundle,
    info: ClaimInfo,
    owner: &KeyPair,
) -> Result<ClaimTeeBundleResponse, ClientError> {
    let mut request = ClaimTeeBundleRequest {
        bundle,
        data: request_data(info, owner),
        signatures: ClaimRequestSignatures::default(),
    };
    request.signatures.request_signature = sign(owner, request.signing_bytes())?;

    let response = match client.request(RpcRequest::ClaimTeeBundle(request)).await? {
        RpcResponse::ClaimTeeBundle(response) => *response,
        other => return Err(unexpected(other)),
    };

    let signatures = response.signatures.as_ref().ok_or_else(|| {
        ClientError::msg(ErrorKind::Claim, "attestor did not sign the claim result")
    })?;
    verify_result(
        owner.signature_type(),
        signatures,
        response.signing_bytes(),
        response.claim.as_ref().map(|claim| claim.sign_data()),
    )?;

    Ok(response)
}

fn request_data(info: ClaimInfo, owner: &KeyPair) -> ClaimRequestData {
    ClaimRequestData {
        provider: info.provider,
        parameters: info.parameters,
        owner: owner.address().to_string(),
        timestamp_s: unix_time(),
        context: info.context,
    }
}

fn sign<E>(owner: &KeyPair, data: Result<Vec<u8>, E>) -> Result<Vec<u8>, ClientError>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let data = data.map_err(|err| ClientError::new(ErrorKind::Internal, Some(Box::new(err))))?;
    owner
        .sign(&data)
        .map_err(|err| ClientError::new(ErrorKind::Claim, Some(Box::new(err))))
}

fn unexpected(response: RpcResponse) -> ClientError {
    ClientError::msg(
        ErrorKind::Rpc,
        format!("unexpected {} response", response.rpc_type()),
    )
}

/// Checks that the result, and the claim if there is one, were signed by
/// the attestor named in `signatures`.
fn verify_result<E>(
    signature_type: SignatureType,
    signatures: &ClaimResultSignatures,
    result_data: Result<Vec<u8>, E>,
    claim_data: Option<Vec<u8>>,
) -> Result<(), ClientError>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let scheme = signature_type.scheme();
    let result_data =
        result_data.map_err(|err| ClientError::new(ErrorKind::Internal, Some(Box::new(err))))?;
    let check = |data: &[u8], signature: &[u8], what: &str| {
        match scheme.verify(data, signature, &signatures.attestor_address) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ClientError::msg(
                ErrorKind::Claim,
                format!("{what} signature was not made by {}", signatures.attestor_address),
            )),
            Err(err) => Err(ClientError::new(ErrorKind::Claim, Some(Box::new(err)))),
        }
    };

    check(&result_data, &signatures.result_signature, "result")?;
    if let Some(claim_data) = claim_data {
        check(&claim_data, &signatures.claim_signature, "claim")?;
    }

    debug!(attestor = %signatures.attestor_address, "verified claim result signatures");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use attestor_core::{
        claim::{ProviderClaimData, DEFAULT_EPOCH},
        msg::CreateTunnelRequest,
        RpcError,
    };

    fn response(attestor: &KeyPair, owner: &KeyPair) -> ClaimTunnelResponse {
        let info = ClaimInfo {
            provider: "http".to_string(),
            parameters: "{}".to_string(),
            context: String::new(),
        };
        let claim = ProviderClaimData::new(info.clone(), owner.address(), 1, DEFAULT_EPOCH);

        let mut response = ClaimTunnelResponse {
            request: ClaimTunnelRequest {
                request: CreateTunnelRequest {
                    id: 1,
                    host: "localhost".to_string(),
                    port: 443,
                    geo_location: None,
                },
                data: request_data(info, owner),
                transcript: Vec::new(),
                signatures: ClaimRequestSignatures::default(),
            },
            claim: Some(claim.clone()),
            error: None,
            signatures: None,
        };
        response.signatures = Some(ClaimResultSignatures {
            attestor_address: attestor.address().to_string(),
            claim_signature: attestor.sign(&claim.sign_data()).unwrap(),
            result_signature: attestor.sign(&response.signing_bytes().unwrap()).unwrap(),
        });
        response
    }

    fn verify(response: &ClaimTunnelResponse) -> Result<(), ClientError> {
        verify_result(
            SignatureType::default(),
            response.signatures.as_ref().unwrap(),
            response.signing_bytes(),
            response.claim.as_ref().map(|claim| claim.sign_data()),
        )
    }

    #[test]
    fn test_verify_result() {
        let attestor = KeyPair::random(SignatureType::default());
        let owner = KeyPair::random(SignatureType::default());

        verify(&response(&attestor, &owner)).unwrap();
    }

    #[test]
    fn test_verify_result_tampered() {
        let attestor = KeyPair::random(SignatureType::default());
        let owner = KeyPair::random(SignatureType::default());

        let mut tampered = response(&attestor, &owner);
        tampered.error = Some(RpcError::invalid_claim("forged"));
        let err = verify(&tampered).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Claim);
    }

    #[test]
    fn test_verify_claim_signature_of_other_key() {
        let attestor = KeyPair::random(SignatureType::default());
        let owner = KeyPair::random(SignatureType::default());

        let mut response = response(&attestor, &owner);
        let claim = response.claim.clone().unwrap();
        let signatures = response.signatures.as_mut().unwrap();
        signatures.claim_signature = owner.sign(&claim.sign_data()).unwrap();

        assert!(verify(&response).is_err());
    }
}

//! Provider registry: validates a claim's content against the revealed
//! application data of its tunnel.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use attestor_core::{claim::ClaimInfo, msg::CreateTunnelRequest, Sender};
use http::Uri;
use serde::Deserialize;
use tls_core::HandshakeSummary;

/// Name of the built-in HTTP provider.
pub const HTTP_PROVIDER: &str = "http";

/// What a provider gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct ClaimReceipt<'a> {
    /// The request the tunnel was created with.
    pub request: &'a CreateTunnelRequest,
    /// The reconstructed TLS session.
    pub handshake: &'a HandshakeSummary,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid provider parameters: {0}")]
    Parameters(#[from] serde_json::Error),
    #[error("invalid url {0:?}")]
    Url(String),
    #[error("no revealed {0} data")]
    NotRevealed(Sender),
    #[error("{0}")]
    Mismatch(String),
}

/// Validates claims of one kind.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name claims refer to the provider by.
    fn name(&self) -> &str;

    /// Checks `claim` against `receipt`, returning the validated claim.
    async fn validate(
        &self,
        receipt: &ClaimReceipt<'_>,
        claim: &ClaimInfo,
    ) -> Result<ClaimInfo, ProviderError>;
}

/// Providers by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

opaque_debug::implement!(ProviderRegistry);

impl ProviderRegistry {
    /// Creates a registry with the built-in providers.
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(HttpProvider));
        registry
    }

    /// Adds `provider`, replacing any provider of the same name.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Returns the provider named `name`.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpParameters {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    response_matches: Vec<ResponseMatch>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ResponseMatch {
    Contains { value: String },
}

/// Checks that the revealed request was made to the claimed URL and that the
/// revealed response contains the claimed values.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProvider;

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        HTTP_PROVIDER
    }

    async fn validate(
        &self,
        receipt: &ClaimReceipt<'_>,
        claim: &ClaimInfo,
    ) -> Result<ClaimInfo, ProviderError> {
        let params: HttpParameters = serde_json::from_str(&claim.parameters)?;
        let uri: Uri = params
            .url
            .parse()
            .map_err(|_| ProviderError::Url(params.url.clone()))?;
        let host = uri
            .host()
            .ok_or_else(|| ProviderError::Url(params.url.clone()))?;

        if !host.eq_ignore_ascii_case(&receipt.request.host) {
            return Err(ProviderError::Mismatch(format!(
                "url host {host} does not match tunnel host {}",
                receipt.request.host
            )));
        }

        // Only the leading revealed records count as the request, so hidden
        // bytes cannot be spliced out of the request line or headers.
        let request = receipt.handshake.revealed_prefix(Sender::Client);
        if request.is_empty() {
            return Err(ProviderError::NotRevealed(Sender::Client));
        }
        let request = String::from_utf8_lossy(&request);
        let mut lines = request.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (method, path) = (parts.next().unwrap_or_default(), parts.next().unwrap_or_default());
        if !method.eq_ignore_ascii_case(&params.method) {
            return Err(ProviderError::Mismatch(format!(
                "request method {method} does not match {}",
                params.method
            )));
        }
        let expected_path = uri.path_and_query().map_or("/", |path| path.as_str());
        if path != expected_path {
            return Err(ProviderError::Mismatch(format!(
                "request path {path} does not match {expected_path}"
            )));
        }

        let host_header = lines
            .take_while(|line| !line.is_empty())
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("host")
                    .then(|| value.trim().to_string())
            })
            .ok_or_else(|| ProviderError::Mismatch("request has no Host header".to_string()))?;
        let header_host = host_header
            .rsplit_once(':')
            .map_or(host_header.as_str(), |(name, _)| name);
        if !header_host.eq_ignore_ascii_case(host) {
            return Err(ProviderError::Mismatch(format!(
                "Host header {host_header} does not match {host}"
            )));
        }

        // A match must lie within one run of adjacent revealed records.
        let response = receipt.handshake.revealed_runs(Sender::Server);
        if response.is_empty() && !params.response_matches.is_empty() {
            return Err(ProviderError::NotRevealed(Sender::Server));
        }
        for ResponseMatch::Contains { value } in &params.response_matches {
            if !response.iter().any(|run| contains(run, value.as_bytes())) {
                return Err(ProviderError::Mismatch(format!(
                    "response does not contain {value:?}"
                )));
            }
        }

        Ok(claim.clone())
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod test {
    use super::*;
    use attestor_core::msg::CreateTunnelRequest;
    use rstest::rstest;
    use tls_core::{reconstruct::ApplicationRecord, CipherSuite, TlsVersion};

    const REQUEST: &[u8] = b"GET /api?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n";
    const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n{\"name\":\"alice\"}";

    fn summary(request: &[u8], response: Option<&[u8]>) -> HandshakeSummary {
        HandshakeSummary {
            version: TlsVersion::V1_3,
            cipher_suite: CipherSuite::TLS13_AES_128_GCM_SHA256,
            server_name: "example.com".to_string(),
            client_random: [0; 32],
            server_random: [0; 32],
            certificates: Vec::new(),
            application_data: vec![
                ApplicationRecord {
                    sender: Sender::Client,
                    index: 10,
                    plaintext: Some(request.to_vec()),
                },
                ApplicationRecord {
                    sender: Sender::Server,
                    index: 11,
                    plaintext: response.map(<[u8]>::to_vec),
                },
            ],
        }
    }

    fn tunnel() -> CreateTunnelRequest {
        CreateTunnelRequest {
            id: 1,
            host: "example.com".to_string(),
            port: 443,
            geo_location: None,
        }
    }

    fn claim(parameters: &str) -> ClaimInfo {
        ClaimInfo {
            provider: HTTP_PROVIDER.to_string(),
            parameters: parameters.to_string(),
            context: String::new(),
        }
    }

    #[tokio::test]
    async fn test_valid_claim() {
        let handshake = summary(REQUEST, Some(RESPONSE));
        let request = tunnel();
        let receipt = ClaimReceipt {
            request: &request,
            handshake: &handshake,
        };
        let claim = claim(
            r#"{"url":"https://example.com/api?x=1","method":"GET","responseMatches":[{"type":"contains","value":"alice"}]}"#,
        );

        let validated = ProviderRegistry::new()
            .get(HTTP_PROVIDER)
            .unwrap()
            .validate(&receipt, &claim)
            .await
            .unwrap();

        assert_eq!(validated, claim);
    }

    #[rstest]
    #[case::wrong_value(r#"{"url":"https://example.com/api?x=1","responseMatches":[{"type":"contains","value":"bob"}]}"#)]
    #[case::wrong_path(r#"{"url":"https://example.com/other"}"#)]
    #[case::wrong_method(r#"{"url":"https://example.com/api?x=1","method":"POST"}"#)]
    #[case::wrong_host(r#"{"url":"https://example.org/api?x=1"}"#)]
    #[case::not_json("url=https://example.com")]
    #[tokio::test]
    async fn test_invalid_claim(#[case] parameters: &str) {
        let handshake = summary(REQUEST, Some(RESPONSE));
        let request = tunnel();
        let receipt = ClaimReceipt {
            request: &request,
            handshake: &handshake,
        };

        assert!(HttpProvider
            .validate(&receipt, &claim(parameters))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_match_across_hidden_record_rejected() {
        let mut handshake = summary(REQUEST, Some(b"HTTP/1.1 200 OK\r\n\r\n{\"name\":\"ali"));
        handshake.application_data.extend([
            ApplicationRecord {
                sender: Sender::Server,
                index: 12,
                plaintext: None,
            },
            ApplicationRecord {
                sender: Sender::Server,
                index: 13,
                plaintext: Some(b"ce\"}".to_vec()),
            },
        ]);
        let request = tunnel();
        let receipt = ClaimReceipt {
            request: &request,
            handshake: &handshake,
        };
        let alice = claim(
            r#"{"url":"https://example.com/api?x=1","responseMatches":[{"type":"contains","value":"alice"}]}"#,
        );
        let name = claim(
            r#"{"url":"https://example.com/api?x=1","responseMatches":[{"type":"contains","value":"\"name\":\"ali"}]}"#,
        );

        assert!(matches!(
            HttpProvider.validate(&receipt, &alice).await,
            Err(ProviderError::Mismatch(_))
        ));
        HttpProvider.validate(&receipt, &name).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_after_hidden_record_ignored() {
        let mut handshake = summary(b"GET /api?x=1 HTTP/1.1\r\n", Some(RESPONSE));
        handshake.application_data.splice(
            1..1,
            [
                ApplicationRecord {
                    sender: Sender::Client,
                    index: 11,
                    plaintext: None,
                },
                ApplicationRecord {
                    sender: Sender::Client,
                    index: 12,
                    plaintext: Some(b"Host: example.com\r\n\r\n".to_vec()),
                },
            ],
        );
        let request = tunnel();
        let receipt = ClaimReceipt {
            request: &request,
            handshake: &handshake,
        };
        let claim = claim(r#"{"url":"https://example.com/api?x=1"}"#);

        assert!(matches!(
            HttpProvider.validate(&receipt, &claim).await,
            Err(ProviderError::Mismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_hidden_response() {
        let handshake = summary(REQUEST, None);
        let request = tunnel();
        let receipt = ClaimReceipt {
            request: &request,
            handshake: &handshake,
        };
        let claim = claim(
            r#"{"url":"https://example.com/api?x=1","responseMatches":[{"type":"contains","value":"alice"}]}"#,
        );

        assert!(matches!(
            HttpProvider.validate(&receipt, &claim).await,
            Err(ProviderError::NotRevealed(Sender::Server))
        ));
    }
}

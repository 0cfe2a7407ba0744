use config::{Config, Environment};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{parse_config_file, util::prepend_file_path, CliFields};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestorServerProperties {
    /// Name and address of the server
    pub server: ServerProperties,
    /// Setting for claim attestation
    pub attestation: AttestationProperties,
    /// Setting for the geolocation proxy
    pub proxy: ProxyProperties,
    /// Setting for authentication of clients
    pub auth: AuthProperties,
    /// Setting for logging
    pub log: LogProperties,
    /// Setting for concurrency limits
    pub concurrency: ConcurrencyProperties,
}

impl AttestorServerProperties {
    pub fn new(cli_fields: &CliFields) -> Result<Self> {
        let mut config = if let Some(config_path) = &cli_fields.config_file {
            let mut config: AttestorServerProperties = parse_config_file(config_path)?;

            // Ensures all relative file paths in the config file are prepended with
            // the config file's parent directory, so that server binary can be run from
            // anywhere.
            let parent_dir = Path::new(config_path)
                .parent()
                .ok_or(eyre!("Failed to get parent directory of config file"))?
                .to_str()
                .ok_or_else(|| eyre!("Failed to convert path to str"))?
                .to_string();

            if let Some(path) = &config.attestation.private_key_path {
                config.attestation.private_key_path = Some(prepend_file_path(path, &parent_dir)?);
            }
            config.attestation.extra_root_cert_paths = config
                .attestation
                .extra_root_cert_paths
                .iter()
                .map(|path| prepend_file_path(path, &parent_dir))
                .collect::<Result<_>>()?;

            config
        } else {
            let default_config = Config::try_from(&AttestorServerProperties::default())?;

            Config::builder()
                .add_source(default_config)
                // Add in settings from environment variables (with a prefix of ATTESTOR and
                // '__' as separator).
                .add_source(
                    Environment::with_prefix("ATTESTOR")
                        .try_parsing(true)
                        .prefix_separator("_")
                        .separator("__"),
                )
                .build()?
                .try_deserialize()?
        };

        // CLI overrides
        if let Some(port) = cli_fields.port {
            config.server.port = port;
        }
        if let Some(level) = &cli_fields.log_level {
            config.log.level = level.clone();
        }

        Ok(config)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerProperties {
    /// Used for testing purpose
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Static html response returned from API root endpoint "/". Default html
    /// response contains placeholder strings that will be replaced with
    /// actual values in server.rs, e.g. {version}, {address}
    pub html_info: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationProperties {
    /// File path of the secp256k1 private key (PKCS#8 PEM) used to sign
    /// claims. A random key is used when unset
    pub private_key_path: Option<String>,
    /// Largest allowed difference in seconds between a claim's timestamp and
    /// the server's clock
    pub max_timestamp_diff_secs: u64,
    /// Seconds to wait for a tunnel's connection to the target host
    pub connect_timeout_secs: u64,
    /// Seconds to wait for a response to a request sent to the client
    pub request_timeout_secs: u64,
    /// PEM files with root certificates to trust in addition to the Mozilla
    /// roots, for tests and private PKI
    pub extra_root_cert_paths: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyProperties {
    /// Address of the HTTPS CONNECT proxy used for tunnels with a
    /// geolocation, as `host:port`. `{geoLocation}` is replaced with the
    /// lower-cased country code
    pub url: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthProperties {
    /// Flag to require clients to present an authentication token
    pub enabled: bool,
    /// Addresses trusted to issue authentication tokens
    pub issuers: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogProperties {
    /// Log verbosity level of the default filtering logic, which is
    /// attestor_server=<level>,attestor_common=<level>,tls_core=<level>
    /// Must be either of <https://docs.rs/tracing/latest/tracing/struct.Level.html#implementations>
    pub level: String,
    /// Custom filtering logic, refer to the syntax here https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#example-syntax
    /// This will override the default filtering logic above
    pub filter: Option<String>,
    /// Log format. Available options are "COMPACT" and "JSON"
    pub format: LogFormat,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyProperties {
    /// The maximum number of concurrent client sessions
    pub max_sessions: usize,
}

impl Default for ServerProperties {
    fn default() -> Self {
        Self {
            name: "attestor".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8001,
            html_info: r#"
                <head>
                    <meta charset='UTF-8'>
                    <meta name='viewport' content='width=device-width, initial-scale=1.0'>
                </head>
                <body>
                    <h1>Attestor Server {version}</h1>
                    <ul>
                    <li>address: <pre>{address}</pre></li>
                    <li><a href='healthcheck'>health check</a></li>
                    <li><a href='info'>info</a></li>
                    </ul>
                </body>
            "#
            .to_string(),
        }
    }
}

impl Default for AttestationProperties {
    fn default() -> Self {
        Self {
            private_key_path: None,
            max_timestamp_diff_secs: 10 * 60,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            extra_root_cert_paths: Vec::new(),
        }
    }
}

impl Default for LogProperties {
    fn default() -> Self {
        Self {
            level: "DEBUG".to_string(),
            filter: None,
            format: LogFormat::Compact,
        }
    }
}

impl Default for ConcurrencyProperties {
    fn default() -> Self {
        Self { max_sessions: 256 }
    }
}

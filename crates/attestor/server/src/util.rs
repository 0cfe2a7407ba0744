use eyre::{eyre, Result};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Parse a yaml configuration file into a struct
pub fn parse_config_file<T: DeserializeOwned>(location: &str) -> Result<T> {
    let file = std::fs::File::open(location)?;
    let config: T = serde_yaml::from_reader(file)?;
    Ok(config)
}

/// Prepend a file path with a base directory if the path is not absolute.
pub fn prepend_file_path<S: AsRef<str>>(file_path: S, base_dir: S) -> Result<String> {
    let path = Path::new(file_path.as_ref());
    if !path.is_absolute() {
        Ok(Path::new(base_dir.as_ref())
            .join(path)
            .to_str()
            .ok_or_else(|| eyre!("Failed to convert path to str"))?
            .to_string())
    } else {
        Ok(file_path.as_ref().to_string())
    }
}

#[cfg(test)]
mod test {
    use crate::{
        config::AttestorServerProperties,
        util::{parse_config_file, prepend_file_path},
        CliFields,
    };

    use super::Result;

    #[test]
    fn test_parse_config_file() {
        let location = "./fixture/config/config.yaml";
        let config: Result<AttestorServerProperties> = parse_config_file(location);
        let config = config.expect("Could not open file or read the file's values.");

        assert_eq!(config.server.port, 8001);
        assert_eq!(config.attestation.max_timestamp_diff_secs, 600);
        assert_eq!(config.proxy.url, None);
    }

    #[test]
    fn test_relative_paths_resolved_against_config_dir() {
        let cli = CliFields {
            config_file: Some("./fixture/config/config.yaml".to_string()),
            port: Some(9000),
            log_level: None,
        };
        let config = AttestorServerProperties::new(&cli).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(
            config.attestation.private_key_path.as_deref(),
            Some("./fixture/config/../attestor/attestor.key")
        );
    }

    #[test]
    fn test_prepend_file_path() {
        let base_dir = "/base/dir";
        let relative_path = "relative/path";
        let absolute_path = "/absolute/path";

        let result = prepend_file_path(relative_path, base_dir);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), "/base/dir/relative/path");

        let result = prepend_file_path(absolute_path, base_dir);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), "/absolute/path");
    }
}

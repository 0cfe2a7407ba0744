use eyre::Result;
use std::str::FromStr;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

use crate::config::{AttestorServerProperties, LogFormat};

fn format_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let f = fmt::layer().with_thread_ids(true).with_thread_names(true);
    match format {
        LogFormat::Compact => f.compact().boxed(),
        LogFormat::Json => f.json().boxed(),
    }
}

/// Returns the filter directives configured for the server.
pub fn filter_directives(config: &AttestorServerProperties) -> Result<String> {
    Ok(match &config.log.filter {
        // Use custom filter that is provided by user
        Some(filter) => filter.clone(),
        // Use the default filter when only verbosity level is provided
        None => {
            let level = Level::from_str(&config.log.level)?;
            format!("attestor_server={level},attestor_common={level},tls_core={level}")
        }
    })
}

pub fn init_tracing(config: &AttestorServerProperties) -> Result<()> {
    let filter_layer = EnvFilter::builder().parse(filter_directives(config)?)?;

    Registry::default()
        .with(filter_layer)
        .with(format_layer(config.log.format))
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_directives() {
        let mut config = AttestorServerProperties::default();
        config.log.level = "info".to_string();

        assert_eq!(
            filter_directives(&config).unwrap(),
            "attestor_server=INFO,attestor_common=INFO,tls_core=INFO"
        );
    }

    #[test]
    fn test_custom_filter_wins() {
        let mut config = AttestorServerProperties::default();
        config.log.filter = Some("warn".to_string());

        assert_eq!(filter_directives(&config).unwrap(), "warn");
    }

    #[test]
    fn test_invalid_level() {
        let mut config = AttestorServerProperties::default();
        config.log.level = "LOUD".to_string();

        assert!(filter_directives(&config).is_err());
    }
}

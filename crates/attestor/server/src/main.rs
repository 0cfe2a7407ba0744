use attestor_server::{
    init_tracing, run_server, AttestorServerError, AttestorServerProperties, CliFields,
};
use clap::Parser;
use eyre::{eyre, Result};
use tracing::debug;

#[tokio::main]
async fn main() -> Result<(), AttestorServerError> {
    // Load command line arguments
    let cli_fields = CliFields::parse();

    let config = AttestorServerProperties::new(&cli_fields)
        .map_err(|err| eyre!("Failed to load config: {}", err))?;

    // Set up tracing for logging
    init_tracing(&config).map_err(|err| eyre!("Failed to set up tracing: {err}"))?;

    debug!(?config, "Server config loaded");

    // Run the server
    run_server(&config).await?;

    Ok(())
}

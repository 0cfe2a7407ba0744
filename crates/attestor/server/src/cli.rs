use clap::Parser;

/// Fields loaded from the command line when launching this server.
#[derive(Clone, Debug, Parser)]
#[command(name = "Attestor Server")]
pub struct CliFields {
    /// Configuration file location
    #[arg(long)]
    pub config_file: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub log_level: Option<String>,
}

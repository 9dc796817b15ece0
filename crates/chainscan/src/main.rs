use anyhow::Result;
use chainscan::cli::{Cli, Command};
use chainscan::commands;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Scan(args) => commands::scan(config, args).await,
        Command::Cache(args) => commands::cache(config, args),
        Command::Graph(args) => commands::graph(config, args).await,
    }
}

use anyhow::Context;
use clap::Parser;
use tracing::error;

use nexa_election::cli::{Cli, CliHandler};
use nexa_election::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.election_config().context("invalid configuration")?;

    logging::init(&config.logging).context("failed to initialise logging")?;

    let handler = CliHandler::new(config).context("failed to set up leader election")?;
    if let Err(e) = handler.handle(&cli.command).await {
        error!("{}", e);
        return Err(e.into());
    }
    Ok(())
}

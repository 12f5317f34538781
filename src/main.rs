use anyhow::Context;
use cascade::cli::{Cli, CliHandler, Commands};
use cascade::logging;
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let handler = CliHandler::load(cli.config.as_ref()).context("loading configuration")?;
    logging::init(&handler.config().logging).context("initialising logging")?;
    match handler.source() {
        Some(path) => info!(config = %path.display(), "Loaded configuration"),
        None => info!("No config file found, using defaults"),
    }

    match cli.command {
        Commands::Run { role } => {
            let (tx, rx) = tokio::sync::mpsc::channel(1);
            ctrlc::set_handler(move || {
                let _ = tx.blocking_send(());
            })
            .context("setting Ctrl-C handler")?;

            info!("Starting cascade");
            handler.run(role, rx).await?;
        }
        Commands::Sources { prefer_root } => {
            let report = handler.sources(prefer_root).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

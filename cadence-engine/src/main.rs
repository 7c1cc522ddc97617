mod scenarios;

use clap::{Parser, Subcommand};
use scenarios::ScenarioName;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cadence-engine")]
#[command(about = "Local demonstration driver for the Cadence orchestration core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs one (or all) of the seed end-to-end scenarios
    /// against a real `Coordinator` over an in-memory store.
    Scenario {
        #[arg(value_enum, default_value = "all")]
        name: ScenarioName,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Scenario { name } => {
            info!("running scenario suite: {name:?}");
            scenarios::run(name).await?;
        }
    }

    Ok(())
}

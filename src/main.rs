use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::Parser;
use tlb::{config, logging, signal, Config, Master};
use tracing::{error, info, warn};

/// Exit status used when a second signal interrupts the graceful shutdown.
const FORCED_EXIT: i32 = 130;

/// TCP load balancer.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path of the TOML configuration file.
    #[arg(required_unless_present = "help_config")]
    config: Option<PathBuf>,

    /// Print the configuration file reference and exit.
    #[arg(long)]
    help_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let Some(path) = cli.config.filter(|_| !cli.help_config) else {
        print!("{}", config::HELP);
        return ExitCode::SUCCESS;
    };

    logging::init();

    match run(&path).await {
        Ok(()) => {
            info!("Exiting");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "Load balancer failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(path: &Path) -> Result<(), tlb::Error> {
    let config = Config::load(path).await?;

    info!(
        version = tlb::VERSION,
        config = %path.display(),
        buffer_size = config.buffer_size,
        "Starting load balancer"
    );

    let master = Master::init(&config)?.shutdown_on(async {
        signal::termination().await;

        tokio::task::spawn(async {
            signal::termination().await;
            warn!("Received second signal, exiting immediately");
            std::process::exit(FORCED_EXIT);
        });
    });

    master.run().await
}

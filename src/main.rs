//! CLI for dedupsub
//!
//! Runs one publish/consume round against the configured broker and
//! prints the run summary as JSON on stdout. Exits non-zero when the
//! broker could not be reached or any publisher failed.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use dedupsub::broker::InMemoryBroker;
use dedupsub::config::{DEFAULT_CONFIG_PATH, Settings, load_config_from};
use dedupsub::orchestrator::{Orchestrator, RunSummary};
use dedupsub::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "dedupsub", about = "Observe at-least-once delivery under simulated failures")]
struct Cli {
    /// Configuration file (extension optional)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
    /// Log level: error, warn, info, debug or trace
    #[arg(long)]
    log_level: Option<String>,
    /// Seed for the failure simulation
    #[arg(long)]
    seed: Option<u64>,
    /// Share of deliveries to fail on purpose (0-100)
    #[arg(long)]
    failure_percent: Option<u8>,
    /// Seconds to wait for consumers after publishing ends
    #[arg(long)]
    drain_timeout: Option<u64>,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(level) = &self.log_level {
            settings.run.log_level = level.clone();
        }
        if let Some(seed) = self.seed {
            settings.consumer.seed = Some(seed);
        }
        if let Some(percent) = self.failure_percent {
            settings.consumer.simulate_failure_percent = percent;
        }
        if let Some(secs) = self.drain_timeout {
            settings.run.drain_timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match run(&cli).await {
        Ok(summary) => {
            match serde_json::to_string(&summary) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("Failed to encode summary: {}", e),
            }
            if summary.publisher_failures > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            // logging may not be up yet if the configuration was rejected
            logging::init("info");
            error!("Run failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<RunSummary, Box<dyn std::error::Error>> {
    let mut settings = load_config_from(&cli.config)?;
    cli.apply(&mut settings);
    settings.validate()?;
    logging::init(&settings.run.log_level);

    let broker = Arc::new(InMemoryBroker::connect(&settings.broker)?);
    let orchestrator = Orchestrator::new(settings, broker);

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received. Stopping run.");
            cancel.cancel();
        }
    });

    Ok(orchestrator.run().await?)
}

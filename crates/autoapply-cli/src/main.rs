use std::sync::Arc;

use anyhow::{Context, Result};
use autoapply_core::AtsKind;
use autoapply_pipeline::{Orchestrator, Pipeline, PipelineConfig};
use autoapply_storage::{SqliteStore, Store};
use autoapply_web::ServerConfig;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "autoapply")]
#[command(about = "Job application pipeline orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP control surface and run the loop worker on demand.
    Serve,
    /// Run a single cycle for one provider and print its report.
    RunOnce {
        #[arg(long)]
        ats: Option<AtsKind>,
    },
    /// Load a provider's company list into storage.
    Seed {
        #[arg(long)]
        ats: AtsKind,
    },
    /// Print pipeline status as JSON.
    Status,
    /// Create the database schema if it does not exist yet.
    Migrate,
}

fn init_tracing() {
    let fallback = std::env::var("AUTOAPPLY_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let pipeline = Arc::new(Pipeline::from_config(&config).await?);
            let orchestrator = Orchestrator::new(pipeline, config.default_ats);
            autoapply_web::serve(&ServerConfig::from_env(), orchestrator).await?;
        }
        Commands::RunOnce { ats } => {
            let pipeline = Pipeline::from_config(&config).await?;
            let report = pipeline.run_cycle(ats.unwrap_or(config.default_ats)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Seed { ats } => {
            let pipeline = Pipeline::from_config(&config).await?;
            let report = pipeline.seed(ats).await?;
            println!(
                "seed complete: ats={} read={} inserted={}",
                report.ats, report.read, report.inserted
            );
        }
        Commands::Status => {
            let pipeline = Arc::new(Pipeline::from_config(&config).await?);
            let status = Orchestrator::new(pipeline, config.default_ats).status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Migrate => {
            let store = SqliteStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening database {}", config.database_url))?;
            store.migrate().await?;
            println!("migrations applied: {}", config.database_url);
        }
    }

    Ok(())
}

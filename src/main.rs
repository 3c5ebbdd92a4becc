pub mod types;
pub mod config;
pub mod geometry;
pub mod proximity;
pub mod catalog;
pub mod repository;
pub mod indicators;
pub mod fusion;
pub mod risk;
pub mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fuse metrics for one municipality and print its hazard assessment
    Assess {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Municipality code
        #[arg(long)]
        code: String,
    },
    /// Find the municipality containing a point
    Locate {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
    /// Serve the assessment API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Assess { config, code } => {
            let app_config = config::AppConfig::load_from_file(config)?;
            let state = server::AppState::from_config(&app_config)?;

            state.fusion.select_and_fuse(code.clone()).await;
            let report = state.report().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Locate { config, lat, lon } => {
            let app_config = config::AppConfig::load_from_file(config)?;
            let repository = repository::MunicipalityRepository::from_path(&app_config.input.boundaries)?;

            match repository.locate(geo::Coord { x: *lon, y: *lat }) {
                Some(m) => println!("{}\t{}\t{}", m.code, m.name, m.region.as_deref().unwrap_or("")),
                None => println!("No municipality contains ({}, {})", lat, lon),
            }
        }
        Commands::Serve { config } => {
            let app_config = config::AppConfig::load_from_file(config)?;
            let state = Arc::new(server::AppState::from_config(&app_config)?);

            server::start_server(&app_config, state).await?;
        }
    }

    Ok(())
}

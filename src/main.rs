use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shelter_geocoder::config::AppConfig;
use shelter_geocoder::resolver::RunHandle;
use shelter_geocoder::{AddressableEntity, GeocoderService, ResolutionEvent, RunOutcome};
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// Resolve shelter listing addresses to coordinates
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Cache directory (overrides GEOCODER_DATA_DIR)
    #[arg(long, global = true, value_hint = clap::ValueHint::DirPath)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve a JSON array of entities, one event per line on stdout
    #[command(visible_alias = "r")]
    Resolve {
        #[arg(value_hint = clap::ValueHint::FilePath)]
        entities: PathBuf,

        /// Run the batch a second time after it completes
        #[arg(long)]
        refresh: bool,
    },

    /// Drop every cached query and entity coordinate
    ClearCache,

    /// Print cache and provider status as JSON
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    let service =
        GeocoderService::initialize(config).context("failed to start geocoder service")?;

    match cli.command {
        Commands::Resolve { entities, refresh } => resolve(&service, &entities, refresh).await,
        Commands::ClearCache => {
            service.clear_cache()?;
            println!("cache cleared");
            Ok(())
        }
        Commands::Health => {
            let health = service.health()?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
    }
}

async fn resolve(service: &GeocoderService, path: &Path, refresh: bool) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let entities: Vec<AddressableEntity> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of entities", path.display()))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = service.submit_batch(entities, tx);
    stream_run(handle, &mut rx).await?;

    if refresh {
        if let Some(handle) = service.refresh_current_batch() {
            stream_run(handle, &mut rx).await?;
        }
    }
    Ok(())
}

async fn stream_run(
    handle: RunHandle,
    rx: &mut UnboundedReceiver<ResolutionEvent>,
) -> Result<RunOutcome> {
    let mut waiter = std::pin::pin!(handle.wait());
    let outcome = loop {
        tokio::select! {
            biased;
            Some(event) = rx.recv() => print_event(&event)?,
            outcome = &mut waiter => break outcome?,
        }
    };
    while let Ok(event) = rx.try_recv() {
        print_event(&event)?;
    }
    Ok(outcome)
}

fn print_event(event: &ResolutionEvent) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, event)?;
    writeln!(stdout)?;
    Ok(())
}

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use address_geomap::{AppConfig, BatchObserver, BatchProgress, GeomapService};
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "geomap")]
#[command(about = "Geocode consumer address worksheets and cluster them for the map")]
#[command(version)]
struct Args {
    /// Directory holding the SQLite database
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a text file with one address per line
    Import { worksheet: String, file: PathBuf },
    /// Geocode every record not attempted yet
    Geocode { worksheet: String },
    /// Print map clusters for a zoom level as JSON
    Clusters {
        worksheet: String,
        #[arg(long, default_value_t = 12.0)]
        zoom: f64,
    },
}

struct ConsoleObserver;

impl BatchObserver for ConsoleObserver {
    fn on_progress(&self, progress: BatchProgress) {
        eprint!("\r{}/{}", progress.completed, progress.total);
    }

    fn on_batch_complete(&self, failed_addresses: &[String]) {
        eprintln!();
        if failed_addresses.is_empty() {
            return;
        }
        eprintln!("not found ({}):", failed_addresses.len());
        for address in failed_addresses {
            eprintln!("  {address}");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let service = GeomapService::initialize(&args.data_dir, AppConfig::from_env())
        .context("failed to initialize geomap service")?;

    match args.command {
        Command::Import { worksheet, file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let addresses: Vec<String> = contents.lines().map(str::to_string).collect();
            let summary = service.import_addresses(&worksheet, &addresses)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Geocode { worksheet } => {
            let cancel_flag = Arc::new(AtomicBool::new(false));
            let flag = cancel_flag.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("cancellation requested; stopping after the current address");
                    flag.store(true, Ordering::SeqCst);
                }
            });
            let report = service
                .geocode_worksheet(&worksheet, Some(Arc::new(ConsoleObserver)), Some(cancel_flag))
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Clusters { worksheet, zoom } => {
            let groups = service.map_clusters(&worksheet, zoom)?;
            println!("{}", serde_json::to_string_pretty(&groups)?);
        }
    }
    Ok(())
}

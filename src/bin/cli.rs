// Offline Core - download orchestration for a mobile media client
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::Context;
use clap::{Parser, Subcommand};
use offline_core::api::MediaItem;
use offline_core::storage::{Database, SqliteKeyValueStore};
use offline_core::{
    logging, DownloadAction, DownloadOrchestrator, DownloadRequest, HttpTransferBackend, OptimizeClient,
    OrchestratorEvent, OrchestratorSettings,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "offline-cli")]
#[command(about = "Offline Core CLI - Desktop testing tool", long_about = None)]
struct Cli {
    /// Settings JSON file (camelCase keys)
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// SQLite database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Authorization header value for the media and optimization servers
    #[arg(long, env = "OFFLINE_AUTHORIZATION")]
    auth: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile once and list this device's jobs
    Jobs,
    /// List downloaded items
    Downloads,
    /// Download an item with the configured method
    Download {
        /// Item id on the media server
        item_id: String,
        /// Stream URL
        url: String,
        /// Display name
        #[arg(short, long, default_value = "")]
        name: String,
        /// File extension
        #[arg(short, long, default_value = "mp4")]
        extension: String,
    },
    /// Delete one downloaded item
    Delete {
        item_id: String,
    },
    /// Delete all downloads and cancel all remote jobs
    DeleteAll,
    /// Poll and print events until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_once();
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => OrchestratorSettings::from_json_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => OrchestratorSettings::default(),
    };

    let db_path = cli.db.clone().unwrap_or_else(Database::get_default_path);
    let db = Database::new(&db_path)
        .await
        .with_context(|| format!("opening database {}", db_path.display()))?;

    let orchestrator = DownloadOrchestrator::new(
        settings.clone(),
        Arc::new(SqliteKeyValueStore::new(db)),
        Arc::new(OptimizeClient::with_timeout(settings.request_timeout())?),
        Arc::new(HttpTransferBackend::new()?),
        cli.auth.clone(),
    )
    .await?;

    match cli.command {
        Commands::Jobs => {
            let jobs = orchestrator.reconcile_now().await?;
            if jobs.is_empty() {
                println!("No jobs for device {}", orchestrator.device_id());
            }
            for job in jobs {
                println!(
                    "{:<38} {:<12} {:>6.1}%  {}",
                    job.id,
                    job.status.as_str(),
                    job.progress,
                    job.item.display_name()
                );
            }
        }
        Commands::Downloads => {
            let items = orchestrator.downloaded_items().await;
            for item in &items {
                println!(
                    "{:<38} {:>10}  {}",
                    item.item.id,
                    item.size.map(format_bytes).unwrap_or_else(|| "?".to_string()),
                    item.file_path.display()
                );
            }
            println!("{} items, {}", items.len(), format_bytes(orchestrator.disk_usage().await));
        }
        Commands::Download {
            item_id,
            url,
            name,
            extension,
        } => {
            let mut events = orchestrator.subscribe();
            let request = DownloadRequest::new(MediaItem::new(item_id.clone(), name), url).with_extension(extension);

            match orchestrator.download(request).await? {
                DownloadAction::Optimizing { job_id } => {
                    println!("Optimization job {} created; run `watch` to follow it", job_id);
                }
                DownloadAction::AlreadyDownloaded { .. } => {
                    println!("{} is already downloaded", item_id);
                }
                DownloadAction::Queued { accepted: false, .. } => {
                    println!("{} is already queued", item_id);
                }
                DownloadAction::Queued { .. } => loop {
                    match events.recv().await {
                        Ok(OrchestratorEvent::Progress(p)) => {
                            eprint!("\r{:>6.1}%  {}", p.percent, p.speed_string());
                        }
                        Ok(OrchestratorEvent::DownloadFinished { downloaded, .. }) => {
                            eprintln!();
                            println!("Saved to {}", downloaded.file_path.display());
                            break;
                        }
                        Ok(OrchestratorEvent::DownloadFailed { message, .. }) => {
                            eprintln!();
                            anyhow::bail!(message);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                },
            }
        }
        Commands::Delete { item_id } => {
            let outcome = orchestrator.delete_download(&item_id).await?;
            match (outcome.record, outcome.warning) {
                (None, _) => println!("{} is not downloaded", item_id),
                (Some(_), None) => println!("Deleted {}", item_id),
                (Some(_), Some(warning)) => println!("Deleted {} ({})", item_id, warning),
            }
        }
        Commands::DeleteAll => {
            let report = orchestrator.delete_all_downloads().await?;
            println!("Deleted {} files", report.files_deleted);
        }
        Commands::Watch => {
            let mut events = orchestrator.subscribe();
            orchestrator.set_foreground(true).await;
            if !orchestrator.is_polling() {
                eprintln!("Not polling: set the optimized method, server URL and --auth");
            }

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(OrchestratorEvent::JobsUpdated(jobs)) => {
                            for job in jobs {
                                println!("{:<38} {:<12} {:>6.1}%", job.id, job.status.as_str(), job.progress);
                            }
                        }
                        Ok(event) => {
                            if let Some(text) = event.notification_text() {
                                println!(">> {}", text);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(_) => break,
                    }
                }
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / 1_000_000.0)
}

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dispatch_core::{
    transitions, BoardView, DispatchCoordinator, DispatchError, DispatchEvent, HttpLoadService,
};
use shared::domain::{DriverId, LoadId, LoadStatus};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

#[derive(Parser, Debug)]
#[command(name = "dispatch", about = "Dispatch board for the load service")]
struct Args {
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    poll_interval_secs: Option<u64>,
    #[arg(long)]
    request_timeout_secs: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch once and print the board.
    Board,
    /// Keep the board in sync and print every change until interrupted.
    Watch,
    /// Move a load to another column.
    Move { load_id: i64, status: LoadStatus },
    /// Bind a driver to an available load.
    Assign { load_id: i64, driver_id: i64 },
    /// Release the driver of an assigned load.
    Unassign { load_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = config::load_settings(&args.config)?;
    if let Some(v) = args.server_url {
        settings.server_url = v;
    }
    if let Some(v) = args.poll_interval_secs {
        settings.poll_interval_secs = v;
    }
    if let Some(v) = args.request_timeout_secs {
        settings.request_timeout_secs = v;
    }
    settings.validate()?;

    let coordinator_config = settings.coordinator_config();
    let remote = HttpLoadService::new(&settings.server_url, coordinator_config.request_timeout)
        .context("failed to build load service client")?;
    info!(server_url = remote.server_url(), "dispatch: using load service");
    let coordinator = DispatchCoordinator::new(Arc::new(remote), coordinator_config);

    coordinator
        .refresh()
        .await
        .with_context(|| format!("failed to load board from {}", settings.server_url))?;

    match args.command {
        Command::Board => print_board(&coordinator.board().await),
        Command::Watch => watch(&coordinator).await?,
        Command::Move { load_id, status } => {
            let load = match coordinator
                .request_status_change(LoadId(load_id), status)
                .await
            {
                Ok(load) => load,
                Err(err @ DispatchError::InvalidTransition { from, .. }) => {
                    let targets: Vec<String> = transitions::allowed_targets(from)
                        .into_iter()
                        .map(|target| target.to_string())
                        .collect();
                    bail!("{err} (allowed from {from}: {})", targets.join(", "));
                }
                Err(err) => return Err(err.into()),
            };
            println!("load {} is now {}", load.id, load.status);
        }
        Command::Assign { load_id, driver_id } => {
            let load = coordinator
                .request_assign(LoadId(load_id), DriverId(driver_id))
                .await?;
            println!("load {} assigned to driver {driver_id}", load.id);
        }
        Command::Unassign { load_id } => {
            let load = coordinator.request_unassign(LoadId(load_id)).await?;
            println!("load {} released, now {}", load.id, load.status);
        }
    }

    Ok(())
}

async fn watch(coordinator: &Arc<DispatchCoordinator>) -> Result<()> {
    let mut events = coordinator.subscribe_events();
    print_board(&coordinator.board().await);
    let polling = coordinator.spawn_polling();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("watch: interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(DispatchEvent::Reconciled(summary)) => {
                    if summary.changed.is_empty() && summary.removed.is_empty() {
                        continue;
                    }
                    println!(
                        "synced: {} loads, {} changed, {} removed, {} kept while pending",
                        summary.applied,
                        summary.changed.len(),
                        summary.removed.len(),
                        summary.skipped.len()
                    );
                    print_board(&coordinator.board().await);
                }
                Ok(DispatchEvent::SyncFailed(reason)) => warn!("watch: refresh failed: {reason}"),
                Ok(DispatchEvent::LoadChanged(load)) => {
                    println!("load {} -> {}", load.id, load.status);
                }
                Ok(DispatchEvent::LoadRemoved(load_id)) => println!("load {load_id} removed"),
                Ok(DispatchEvent::MutationRolledBack { load_id, reason, .. }) => {
                    println!("load {load_id} change undone: {reason}");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "watch: fell behind on events");
                    print_board(&coordinator.board().await);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    polling.stop();
    Ok(())
}

fn print_board(board: &BoardView) {
    if let Some(stats) = board.stats {
        println!(
            "available {} | assigned {} | in transit {} | delivered today {} | drivers {} | trucks {}",
            stats.available_loads,
            stats.assigned_loads,
            stats.in_transit_loads,
            stats.delivered_today,
            stats.available_drivers,
            stats.available_trucks
        );
    }
    for column in &board.columns {
        println!("\n[{}] ({})", column.status, column.loads.len());
        for load in &column.loads {
            let driver = load
                .driver_id
                .map(|id| format!(" driver={id}"))
                .unwrap_or_default();
            let rate = load
                .rate_amount
                .map(|rate| format!(" ${rate:.2}"))
                .unwrap_or_default();
            let pending = if board.pending.contains(&load.id) {
                " (pending)"
            } else {
                ""
            };
            println!(
                "  #{} {} -> {}{rate}{driver}{pending}",
                load.id, load.pickup_address, load.delivery_address
            );
        }
    }
    if !board.drivers.is_empty() {
        println!("\nfree drivers:");
        for driver in &board.drivers {
            println!("  {} {}", driver.id, driver.name);
        }
    }
}

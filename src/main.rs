//! Binance Futures Copy-Trading Engine
//!
//! Mirrors the positions of leaderboard traders onto client accounts, each
//! scaled by its own ratio.

mod api;
mod coordinator;
mod error;
mod models;
mod settings;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{Account, BinanceGateway, ExchangeGateway};
use crate::coordinator::{initialize_exchange, Coordinator};
use crate::settings::Settings;

/// Binance futures copy-trading CLI.
#[derive(Parser)]
#[command(name = "copier")]
#[command(about = "Mirror Binance leaderboard traders onto client accounts", long_about = None)]
struct Cli {
    /// Settings file path
    #[arg(short, long, env = "COPIER_SETTINGS", default_value = "settings.json")]
    settings: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start mirroring every configured client
    Run {
        /// Dry run (simulate client orders)
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate the settings file and print the subscription graph
    Check,

    /// Print the current positions of a leaderboard trader
    Snapshot {
        /// Trader's encrypted leaderboard uid
        uid: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = Settings::load(&cli.settings)?;

    match cli.command {
        Commands::Run { dry_run } => {
            settings.validate()?;
            run(settings, dry_run).await?;
        }

        Commands::Check => {
            settings.validate()?;

            println!("\nSettings OK: {}", cli.settings.display());
            println!("Venue: {}", settings.base_url);
            println!("\n{:<20} {:<36}", "TRADER", "UID");
            println!("{}", "-".repeat(56));
            for t in &settings.traders {
                println!("{:<20} {:<36}", truncate(&t.name, 18), t.account_id);
            }

            println!("\n{:<20} {:<20} {:>10}", "CLIENT", "TRADER", "RATIO");
            println!("{}", "-".repeat(52));
            for c in &settings.clients {
                for sub in &c.subscriptions {
                    println!(
                        "{:<20} {:<20} {:>10}",
                        truncate(&c.name, 18),
                        truncate(&sub.trader_name, 18),
                        sub.ratio
                    );
                }
            }
            println!("\nEngine: {:?}", settings.engine);
        }

        Commands::Snapshot { uid } => {
            let gateway = BinanceGateway::connect(settings.master_credentials(), &settings.base_url).await?;
            let positions = gateway.fetch_positions(&Account::trader(uid.clone())).await?;

            println!("\n=== Trader: {} ===", uid);
            if positions.is_empty() {
                println!("No open positions.");
            } else {
                println!("{:<16} {:>16} {:>12}", "SYMBOL", "SIZE", "LOT");
                println!("{}", "-".repeat(46));
                for (symbol, size) in positions.iter() {
                    let lot = gateway
                        .lot_size(symbol)
                        .map(|l| l.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{:<16} {:>16} {:>12}", symbol, size, lot);
                }
            }
        }
    }

    Ok(())
}

async fn run(settings: Settings, dry_run: bool) -> Result<()> {
    info!(dry_run, base_url = %settings.base_url, "Initializing copier...");

    let gateway =
        initialize_exchange(settings.master_credentials(), &settings.base_url, dry_run).await?;
    let coordinator = Arc::new(Coordinator::new(gateway, settings.engine.clone()));

    // Register shutdown handler before startup so Ctrl+C during
    // reconciliation still goes through the ordered shutdown.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            shutdown.cancel();
        });
    }
    let runner = {
        let coordinator = Arc::clone(&coordinator);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { coordinator.run_until_cancelled(shutdown).await })
    };

    let started = start_all(&coordinator, &settings, &shutdown).await;
    if started.is_err() {
        shutdown.cancel();
    }
    if !shutdown.is_cancelled() {
        let status = coordinator.status().await;
        println!(
            "\nMirroring {} trader(s) onto {} client(s){}. Press Ctrl+C to stop.\n",
            status.traders.len(),
            status.clients.len(),
            if dry_run { " [DRY RUN]" } else { "" }
        );
    }

    let status = runner.await.context("shutdown task failed")?;
    started?;
    println!("\n{}", status);
    Ok(())
}

/// Add every configured trader, then every client. Configuration errors
/// abort startup; other failures only skip the entity.
async fn start_all(
    coordinator: &Coordinator,
    settings: &Settings,
    shutdown: &CancellationToken,
) -> Result<()> {
    let traders = coordinator.add_traders(&settings.traders).await;
    if shutdown.is_cancelled() {
        return Ok(());
    }
    let traders_ok = traders.iter().filter(|(_, r)| r.is_ok()).count();
    if let Some((name, Err(e))) = traders
        .iter()
        .find(|(_, r)| matches!(r, Err(e) if e.is_configuration()))
    {
        bail!("Trader '{}' is misconfigured: {}", name, e);
    }
    if traders_ok == 0 && !traders.is_empty() {
        bail!("No trader could be started");
    }

    let clients = coordinator.add_clients(&settings.client_specs()).await;
    if shutdown.is_cancelled() {
        return Ok(());
    }
    if let Some((name, Err(e))) = clients
        .iter()
        .find(|(_, r)| matches!(r, Err(e) if e.is_configuration()))
    {
        bail!("Client '{}' is misconfigured: {}", name, e);
    }
    let clients_ok = clients.iter().filter(|(_, r)| r.is_ok()).count();
    if clients_ok < clients.len() {
        warn!(
            failed = clients.len() - clients_ok,
            "Some clients failed to start and are not mirrored"
        );
    }

    info!(traders = traders_ok, clients = clients_ok, "Copier running");
    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

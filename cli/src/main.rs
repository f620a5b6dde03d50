//! ChainScan CLI — scan, cache, and audit wallet history against a daemon.
//!
//! # Commands
//! ```
//! chainscan query      <addresses...> [--start <h|date>] [--end <h|date>]
//! chainscan cache      <addresses...> [--start <h|date>] [--blocks <n>] [--force]
//! chainscan locator    show [addresses...] | erase <addresses...> [--confirm]
//! chainscan checkpoint set|show|list|prune|prune-orphans
//! chainscan reorg-check
//! ```
//!
//! Results print as pretty JSON on stdout; diagnostics go to tracing on
//! stderr. Destructive subcommands are dry runs without `--confirm`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use chainscan_core::{
    CacheSpan, PruneThreshold, RangeBound, RecordFormat, ScanEngine, ScanError, ScanOptions,
};
use chainscan_rpc::{DaemonClient, DaemonConfig};
use chainscan_storage::JsonFileSnapshots;

mod settings;

use settings::Settings;

#[derive(Parser)]
#[command(
    name = "chainscan",
    about = "Incremental blockchain scanner with a persistent address cache",
    version
)]
struct Cli {
    /// Path to a TOML config file (default: the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List transactions involving the given addresses
    Query {
        /// Addresses to match (optional with --unfiltered)
        addresses: Vec<String>,
        /// Start bound: block height or YYYY-MM-DD
        #[arg(long, default_value = "0")]
        start: String,
        /// End bound: block height or YYYY-MM-DD (default: the tip)
        #[arg(long)]
        end: Option<String>,
        /// Scan every block instead of reusing cached heights
        #[arg(long)]
        no_locator: bool,
        /// Include coinbase transactions
        #[arg(long)]
        include_coinbase: bool,
        /// Report every transaction, not just the matching ones
        #[arg(long)]
        unfiltered: bool,
        /// Emit the daemon's raw decoded transactions
        #[arg(long)]
        raw: bool,
    },

    /// Scan forward and persist locator progress for the given addresses
    Cache {
        #[arg(required = true)]
        addresses: Vec<String>,
        /// Start bound: block height or YYYY-MM-DD
        #[arg(long, default_value = "0")]
        start: String,
        /// Number of blocks to scan (default: through the tip)
        #[arg(long)]
        blocks: Option<u64>,
        /// Realign each record to the start height, discarding stale data
        #[arg(long)]
        force: bool,
    },

    /// Inspect or erase per-address locator records
    Locator {
        #[command(subcommand)]
        action: LocatorAction,
    },

    /// Manage reorg-guard checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Compare the newest checkpoint against the live chain
    #[command(name = "reorg-check")]
    ReorgCheck,
}

#[derive(Subcommand)]
enum LocatorAction {
    /// Show locator records (all tracked addresses when none given)
    Show { addresses: Vec<String> },
    /// Remove locator records; dry run without --confirm
    Erase {
        #[arg(required = true)]
        addresses: Vec<String>,
        #[arg(long)]
        confirm: bool,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Store a checkpoint at a height (default: the current tip)
    Set {
        #[arg(long)]
        height: Option<u64>,
    },
    /// Show the checkpoint at a height (default: the newest)
    Show {
        #[arg(long)]
        height: Option<u64>,
    },
    /// List all stored checkpoints
    List,
    /// Delete old checkpoints; dry run without --confirm
    #[command(group(ArgGroup::new("threshold").required(true).args(["depth", "below"])))]
    Prune {
        /// Drop checkpoints more than this many blocks below the newest
        #[arg(long)]
        depth: Option<u64>,
        /// Drop checkpoints below this absolute height
        #[arg(long)]
        below: Option<u64>,
        #[arg(long)]
        confirm: bool,
    },
    /// Delete checkpoints the live chain no longer contains, plus the
    /// cached heights above the highest survivor; dry run without --confirm
    #[command(name = "prune-orphans")]
    PruneOrphans {
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    if let Err(err) = run(cli.command, &settings).await {
        if let Some(ScanError::ReorgDetected { height, .. }) = err.downcast_ref::<ScanError>() {
            eprintln!("error: {err}");
            eprintln!(
                "the chain diverged from the stored checkpoint at height {height}; \
                 run `chainscan checkpoint prune-orphans --confirm` to discard \
                 orphaned state, then retry"
            );
            std::process::exit(2);
        }
        return Err(err);
    }
    Ok(())
}

async fn run(command: Commands, settings: &Settings) -> Result<()> {
    let mut config = DaemonConfig::new(&settings.rpc_url);
    if let (Some(user), Some(password)) = (&settings.rpc_user, &settings.rpc_password) {
        config = config.with_auth(user, password);
    }
    let chain = DaemonClient::new(config)?;
    let snapshots = Arc::new(JsonFileSnapshots::new(settings.snapshot_path()));
    let mut engine = ScanEngine::open(chain, snapshots).await;

    // Ctrl-C requests a cooperative stop; the scan loop finishes the block
    // in flight and persists what it completed.
    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current block");
            cancel.cancel();
        }
    });

    match command {
        Commands::Query {
            addresses,
            start,
            end,
            no_locator,
            include_coinbase,
            unfiltered,
            raw,
        } => {
            let start: RangeBound = start.parse()?;
            let end = match end {
                Some(s) => s.parse()?,
                None => RangeBound::Height(u64::MAX),
            };
            let options = ScanOptions {
                use_locator: !no_locator,
                include_coinbase,
                unfiltered,
                format: if raw {
                    RecordFormat::Raw
                } else {
                    RecordFormat::Structured
                },
            };
            let outcome = engine
                .list_transactions(&addresses, start, end, options)
                .await?;
            print_json(&outcome)
        }

        Commands::Cache {
            addresses,
            start,
            blocks,
            force,
        } => {
            let start: RangeBound = start.parse()?;
            let span = match blocks {
                Some(n) => CacheSpan::Blocks(n),
                None => CacheSpan::ToTip,
            };
            let report = engine.cache_addresses(&addresses, start, span, force).await?;
            print_json(&report)
        }

        Commands::Locator { action } => match action {
            LocatorAction::Show { addresses } => {
                let filter = (!addresses.is_empty()).then_some(addresses.as_slice());
                print_json(&engine.show_locators(filter))
            }
            LocatorAction::Erase { addresses, confirm } => {
                let report = engine.erase_locators(&addresses, confirm).await?;
                print_json(&report)
            }
        },

        Commands::Checkpoint { action } => match action {
            CheckpointAction::Set { height } => {
                let cp = engine.set_checkpoint(height).await?;
                print_json(&cp)
            }
            CheckpointAction::Show { height } => match engine.show_checkpoint(height) {
                Some(cp) => print_json(&cp),
                None => anyhow::bail!(match height {
                    Some(h) => format!("no checkpoint at height {h}"),
                    None => "no checkpoints stored".to_string(),
                }),
            },
            CheckpointAction::List => print_json(&engine.list_checkpoints()),
            CheckpointAction::Prune {
                depth,
                below,
                confirm,
            } => {
                let threshold = match (depth, below) {
                    (Some(d), None) => PruneThreshold::Depth(d),
                    (None, Some(h)) => PruneThreshold::Below(h),
                    // clap's ArgGroup guarantees exactly one.
                    _ => unreachable!(),
                };
                let report = engine.prune_checkpoints(threshold, confirm).await?;
                print_json(&report)
            }
            CheckpointAction::PruneOrphans { confirm } => {
                let report = engine.prune_orphan_checkpoints(confirm).await?;
                print_json(&report)
            }
        },

        Commands::ReorgCheck => {
            let status = engine.reorg_check().await?;
            print_json(&status)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing output")?
    );
    Ok(())
}

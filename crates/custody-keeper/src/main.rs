//! Custody keeper - evidence anchoring daemon and operator CLI
//!
//! # Usage
//!
//! ```bash
//! # Run the keeper, reading JSON evidence lines from stdin
//! custody-keeper run --stdin
//!
//! # Digest and attest a file without anchoring it
//! custody-keeper record capture.bin
//!
//! # Anchor files as one batch
//! custody-keeper anchor session.json export.json --chains evm,solana
//!
//! # Inspect anchoring state
//! custody-keeper status --evidence <uuid>
//! custody-keeper failed
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use custody_keeper::{telemetry, KeeperConfig};

mod commands;

use commands::{record, run, status};

/// Custody keeper
///
/// Digests evidence, batches it under Merkle roots and anchors the roots on
/// one or more chains.
#[derive(Parser)]
#[command(
    name = "custody-keeper",
    version,
    about = "Evidence anchoring keeper",
    long_about = "Digests evidence, commits batches to Merkle roots and drives\n\
                  each root through a durable outbox onto the configured chains."
)]
struct Cli {
    /// Outbox database URL
    #[arg(long, env = "KEEPER_DB_URL", global = true)]
    db: Option<String>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the keeper loop and batch pipeline
    Run(run::RunArgs),

    /// Digest and attest a file
    Record(record::RecordArgs),

    /// Record files and enqueue them as one batch
    Anchor(record::AnchorArgs),

    /// Show anchoring status of evidence, a batch or a job
    Status(status::StatusArgs),

    /// List jobs that failed terminally
    Failed,

    /// Return interrupted submissions to the queue
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose);

    let mut config = KeeperConfig::from_env().context("Invalid keeper configuration")?;
    if let Some(db) = cli.db {
        config.db_url = db;
    }

    match cli.command {
        Commands::Run(args) => run::run(args, config).await,
        Commands::Record(args) => record::record(args, &config),
        Commands::Anchor(args) => record::anchor(args, &config).await,
        Commands::Status(args) => status::status(args, &config).await,
        Commands::Failed => status::failed(&config).await,
        Commands::Recover => status::recover(&config).await,
    }
}

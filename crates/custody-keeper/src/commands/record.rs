//! Record and anchor commands
//!
//! Usage:
//! ```bash
//! custody-keeper record capture.bin --source sensor_capture
//! custody-keeper anchor a.json b.json --json --chains evm,solana
//! ```

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Table};
use custody_core::{AnchorBatch, EvidenceContent, EvidenceRecord, EvidenceRecorder};
use custody_keeper::{config::parse_chains, KeeperConfig};
use custody_queue::OutboxStore;
use std::path::{Path, PathBuf};

use super::{heading, open_store, parse_source, print_success, system_clock};

/// Arguments for the record command
#[derive(Args)]
pub struct RecordArgs {
    /// Evidence file
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Treat the file as JSON and digest its canonical form
    #[arg(long)]
    json: bool,

    /// Source type, e.g. detection_session or simulator_export
    #[arg(long, default_value = "manual")]
    source: String,
}

/// Arguments for the anchor command
#[derive(Args)]
pub struct AnchorArgs {
    /// Evidence files, anchored in the given order
    #[arg(value_name = "FILE", required = true)]
    files: Vec<PathBuf>,

    /// Treat the files as JSON and digest their canonical form
    #[arg(long)]
    json: bool,

    #[arg(long, default_value = "manual")]
    source: String,

    /// Target chains; defaults to KEEPER_CHAINS
    #[arg(long)]
    chains: Option<String>,
}

fn read_record(path: &Path, json: bool, source: &str) -> Result<EvidenceRecord> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read evidence file: {}", path.display()))?;
    let content = if json {
        EvidenceContent::Json(
            serde_json::from_slice(&bytes)
                .with_context(|| format!("{} is not valid JSON", path.display()))?,
        )
    } else {
        EvidenceContent::Bytes(bytes)
    };
    let metadata = serde_json::json!({ "file": path.display().to_string() });

    EvidenceRecorder::new()
        .record(&content, parse_source(source), metadata)
        .with_context(|| format!("Failed to record {}", path.display()))
}

/// Digest a file and print its attestation
pub fn record(args: RecordArgs, config: &KeeperConfig) -> Result<()> {
    let record = read_record(&args.file, args.json, &args.source)?;
    let signer = config.attestation_signer()?;
    let attestation = signer.sign(&record);

    heading("Evidence Record");
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.add_row(vec!["Evidence ID".to_string(), record.id.to_string()]);
    table.add_row(vec!["Digest".to_string(), record.content_hash.to_hex()]);
    table.add_row(vec!["Recorded".to_string(), record.created_at.to_rfc3339()]);
    table.add_row(vec!["Signature".to_string(), attestation.signature.clone()]);
    table.add_row(vec!["Key ID".to_string(), attestation.public_key_id.clone()]);
    table.add_row(vec!["Public key".to_string(), signer.public_key_hex()]);
    table.add_row(vec![
        "Valid until".to_string(),
        attestation.valid_until.to_rfc3339(),
    ]);
    println!("{table}");
    Ok(())
}

/// Record files and enqueue them as one batch
pub async fn anchor(args: AnchorArgs, config: &KeeperConfig) -> Result<()> {
    let chains = match &args.chains {
        Some(raw) => parse_chains(raw)?,
        None => config.chains.clone(),
    };

    let records = args
        .files
        .iter()
        .map(|f| read_record(f, args.json, &args.source))
        .collect::<Result<Vec<_>>>()?;
    let batch = AnchorBatch::from_records(&records, chrono::Utc::now())
        .context("No evidence to anchor")?;

    let store = open_store(config, system_clock()).await?;
    let jobs = store.enqueue(&batch, &chains).await?;

    heading("Batch Enqueued");
    println!("  {} {}", "Batch:".dimmed(), batch.batch_id);
    println!("  {} {}", "Merkle root:".dimmed(), batch.merkle_root);
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Evidence ID", "File", "Digest"]);
    for (record, file) in records.iter().zip(&args.files) {
        table.add_row(vec![
            record.id.to_string(),
            file.display().to_string(),
            record.content_hash.to_hex(),
        ]);
    }
    println!("{table}");

    for job in &jobs {
        print_success(&format!("job {} queued for {}", job.job_id, job.chain));
    }
    Ok(())
}

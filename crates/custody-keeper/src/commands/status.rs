//! Status, failed and recover commands

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Table};
use custody_core::{BatchId, EvidenceId};
use custody_keeper::KeeperConfig;
use custody_queue::{BatchStatus, JobId, JobState, OutboxJob, OutboxStore};
use uuid::Uuid;

use super::{heading, open_store, print_success, print_warning, system_clock};

/// Arguments for the status command
#[derive(Args)]
pub struct StatusArgs {
    /// Evidence ID
    #[arg(long, conflicts_with_all = ["batch", "job"])]
    evidence: Option<Uuid>,

    /// Batch ID
    #[arg(long, conflicts_with = "job")]
    batch: Option<Uuid>,

    /// Job ID
    #[arg(long)]
    job: Option<Uuid>,
}

fn jobs_table(jobs: &[OutboxJob]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        "Job", "Chain", "State", "Attempts", "Next attempt", "Last error",
    ]);
    for job in jobs {
        let state = match job.state {
            JobState::Confirmed => job.state.to_string().green(),
            JobState::Failed => job.state.to_string().red(),
            _ => job.state.to_string().yellow(),
        };
        let next = if job.state == JobState::Queued {
            job.next_attempt_at.to_rfc3339()
        } else {
            "-".to_string()
        };
        table.add_row(vec![
            job.job_id.to_string(),
            job.chain.to_string(),
            state.to_string(),
            job.attempt_count.to_string(),
            next,
            job.last_error.clone().unwrap_or_default(),
        ]);
    }
    table
}

fn describe(status: &BatchStatus) -> String {
    let list = |chains: &[custody_core::Chain]| {
        chains.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(", ")
    };
    match status {
        BatchStatus::Pending { pending } => format!("pending ({})", list(pending)).yellow().to_string(),
        BatchStatus::PartiallyAnchored { confirmed, pending } => format!(
            "partially anchored: confirmed on {}, pending on {}",
            list(confirmed),
            list(pending)
        )
        .yellow()
        .to_string(),
        BatchStatus::FullyAnchored { confirmed } => {
            format!("fully anchored ({})", list(confirmed)).green().to_string()
        }
        BatchStatus::Failed { confirmed, failed } => format!(
            "failed on {} (confirmed on {})",
            list(failed),
            if confirmed.is_empty() { "none".to_string() } else { list(confirmed) }
        )
        .red()
        .to_string(),
    }
}

pub async fn status(args: StatusArgs, config: &KeeperConfig) -> Result<()> {
    let store = open_store(config, system_clock()).await?;

    if let Some(evidence_id) = args.evidence {
        return evidence_status(store.as_ref(), evidence_id, config).await;
    }
    if let Some(batch_id) = args.batch {
        return batch_status(store.as_ref(), batch_id, config).await;
    }
    if let Some(job_id) = args.job {
        return job_status(store.as_ref(), job_id).await;
    }

    let stats = store.stats().await?;
    heading("Outbox");
    println!("  {} {}", "Batches:".dimmed(), stats.batches);
    println!("  {} {}", "Queued:".dimmed(), stats.queued);
    println!("  {} {}", "Submitting:".dimmed(), stats.submitting);
    println!("  {} {}", "Submitted:".dimmed(), stats.submitted);
    println!("  {} {}", "Confirmed:".dimmed(), stats.confirmed);
    println!("  {} {}", "Failed:".dimmed(), stats.failed);
    Ok(())
}

async fn evidence_status(
    store: &dyn OutboxStore,
    evidence_id: EvidenceId,
    config: &KeeperConfig,
) -> Result<()> {
    let Some(batch) = store.batch_for_evidence(evidence_id).await? else {
        bail!("Evidence {} is not part of any batch", evidence_id);
    };
    let proof = store
        .proof_for_evidence(evidence_id)
        .await?
        .context("Batch has no inclusion proof for this evidence")?;

    heading("Evidence Status");
    println!("  {} {}", "Evidence:".dimmed(), evidence_id);
    println!("  {} {}", "Digest:".dimmed(), proof.leaf);
    println!("  {} {} (leaf {})", "Batch:".dimmed(), batch.batch_id, proof.leaf_index);
    println!("  {} {}", "Merkle root:".dimmed(), batch.merkle_root);
    if proof.verify(&batch.merkle_root) {
        print_success("Inclusion proof verifies against the batch root");
    } else {
        print_warning("Inclusion proof does NOT verify against the batch root");
    }
    println!();

    batch_status(store, batch.batch_id, config).await
}

async fn batch_status(store: &dyn OutboxStore, batch_id: BatchId, config: &KeeperConfig) -> Result<()> {
    let status = store.batch_status(batch_id, config.quorum).await?;
    let jobs = store.jobs_for_batch(batch_id).await?;

    println!("  {} {}", "Batch status:".dimmed(), describe(&status));
    println!("{}", jobs_table(&jobs));

    for job in &jobs {
        for tx in store.tx_refs(job.job_id).await? {
            let marker = if tx.abandoned { " (abandoned)" } else { "" };
            println!(
                "  {} {} {}{} confirmations={}",
                job.chain.to_string().dimmed(),
                tx.tx_reference,
                tx.submitted_at.to_rfc3339().dimmed(),
                marker,
                tx.confirmations
            );
        }
    }
    Ok(())
}

async fn job_status(store: &dyn OutboxStore, job_id: JobId) -> Result<()> {
    let job = store.get_job(job_id).await?;
    heading("Job Status");
    println!("{}", jobs_table(std::slice::from_ref(&job)));
    if job.needs_reconcile {
        print_warning("Next attempt checks the chain for an existing anchor first");
    }
    Ok(())
}

/// List terminal failures for operator remediation
pub async fn failed(config: &KeeperConfig) -> Result<()> {
    let store = open_store(config, system_clock()).await?;
    let jobs = store.jobs_in_state(JobState::Failed).await?;

    heading("Failed Jobs");
    if jobs.is_empty() {
        print_success("No failed jobs");
        return Ok(());
    }
    println!("{}", jobs_table(&jobs));
    println!();
    print_warning(&format!(
        "{} job(s) need operator action; their evidence is not anchored",
        jobs.len()
    ));
    Ok(())
}

/// Run crash recovery once
pub async fn recover(config: &KeeperConfig) -> Result<()> {
    let store = open_store(config, system_clock()).await?;
    let timeout = chrono::Duration::from_std(config.recovery_timeout)
        .context("Recovery timeout out of range")?;
    let recovered = store.recover_stale(timeout).await?;

    heading("Recovery");
    if recovered.is_empty() {
        print_success("No interrupted submissions");
    } else {
        println!("{}", jobs_table(&recovered));
        print_success(&format!("{} job(s) returned to the queue", recovered.len()));
    }
    Ok(())
}

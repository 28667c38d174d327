//! Run command - keeper loop plus batch pipeline

use anyhow::Result;
use clap::Args;
use custody_core::{EvidenceContent, EvidenceRecorder};
use custody_keeper::{
    build_registry, pipeline, AnchorOrchestrator, BatchPipeline, EvidenceSender, KeeperConfig,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{open_store, parse_source, system_clock};

/// Arguments for the run command
#[derive(Args)]
pub struct RunArgs {
    /// Read newline-delimited JSON evidence from stdin
    #[arg(long)]
    stdin: bool,

    /// Source type for evidence read from stdin
    #[arg(long, default_value = "detection_session")]
    source: String,

    /// Intake channel capacity
    #[arg(long, default_value_t = 1024)]
    queue_capacity: usize,
}

pub async fn run(args: RunArgs, config: KeeperConfig) -> Result<()> {
    info!(config = ?config, "Starting custody keeper");

    let clock = system_clock();
    let store = open_store(&config, clock.clone()).await?;
    let registry = Arc::new(build_registry(&config, clock.clone())?);

    for chain in registry.chains() {
        if let Some(provider) = registry.get(chain) {
            if !provider.is_healthy().await {
                warn!(chain = %chain, provider = provider.name(), "Provider health check failed");
            }
        }
    }

    let orchestrator = AnchorOrchestrator::new(
        store.clone(),
        registry,
        clock.clone(),
        config.orchestrator(),
    );
    let (evidence_tx, evidence_rx) = pipeline::channel(args.queue_capacity);
    let pipeline = BatchPipeline::new(store, config.chains.clone(), config.batch.clone(), clock);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Without stdin intake the sender is held until shutdown so the pipeline
    // keeps running; batches then come from other keepers sharing the outbox
    let idle_intake = if args.stdin {
        let signer = config.attestation_signer()?;
        let source = args.source.clone();
        tokio::spawn(async move {
            if let Err(e) = read_stdin(evidence_tx, &source, &signer).await {
                error!(error = %e, "Evidence intake stopped");
            }
        });
        None
    } else {
        Some(evidence_tx)
    };

    let pipeline_task = tokio::spawn(pipeline.run(evidence_rx, shutdown_rx.clone()));
    let orchestrator_task = tokio::spawn(async move { orchestrator.run(shutdown_rx).await });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    drop(idle_intake);

    match pipeline_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Pipeline shut down with unsaved batches"),
        Err(e) => error!(error = %e, "Pipeline task panicked"),
    }
    if let Err(e) = orchestrator_task.await {
        error!(error = %e, "Orchestrator task panicked");
    }

    info!("Keeper shutdown complete");
    Ok(())
}

async fn read_stdin(
    tx: EvidenceSender,
    source: &str,
    signer: &custody_core::AttestationSigner,
) -> Result<()> {
    let recorder = EvidenceRecorder::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Skipping malformed evidence line");
                continue;
            }
        };
        let record = match recorder.record(
            &EvidenceContent::Json(value),
            parse_source(source),
            serde_json::json!({ "intake": "stdin" }),
        ) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Skipping invalid evidence");
                continue;
            }
        };

        let attestation = signer.sign(&record);
        info!(
            evidence_id = %record.id,
            digest = %record.content_hash,
            signature = %attestation.signature,
            key_id = %attestation.public_key_id,
            "Evidence recorded"
        );
        if tx.send(record).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

//! Subcommand implementations

pub mod record;
pub mod run;
pub mod status;

use anyhow::{Context, Result};
use colored::Colorize;
use custody_core::SourceType;
use custody_keeper::KeeperConfig;
use custody_persist::SqliteOutbox;
use custody_queue::{Clock, SystemClock};
use std::sync::Arc;

/// Open the configured outbox, running migrations
pub async fn open_store(config: &KeeperConfig, clock: Arc<dyn Clock>) -> Result<Arc<SqliteOutbox>> {
    let pool = custody_persist::connect(&config.sqlite())
        .await
        .with_context(|| format!("Failed to open outbox at {}", config.db_url))?;
    Ok(Arc::new(SqliteOutbox::with_policy(pool, config.backoff, clock)))
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// `detection_session`, `manual`, ... or any other label as a custom source
pub fn parse_source(raw: &str) -> SourceType {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .unwrap_or_else(|_| SourceType::Custom(raw.to_string()))
}

pub fn heading(title: &str) {
    println!("{}", title.bold().cyan());
    println!("{}", "═".repeat(40).cyan());
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

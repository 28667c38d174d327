//! # Custody Persistence
//!
//! SQLite-backed [`OutboxStore`](custody_queue::OutboxStore).
//!
//! The schema is embedded and migrated on connect. Jobs, batches, merkle
//! proofs and transaction references live in the same database, so a
//! keeper that restarts picks up exactly where it stopped.

pub mod outbox;
pub mod sqlite;

pub use outbox::SqliteOutbox;
pub use sqlite::{connect, SqliteConfig};

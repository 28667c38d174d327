//! # Custody Queue
//!
//! The outbox: one durable job per (batch, chain), driven through
//! `Queued → Submitting → Submitted → Confirmed` or into `Failed`.
//!
//! Features:
//! - [`OutboxStore`] contract with an atomic `claim_next`
//! - Exponential backoff with bounded jitter ([`BackoffPolicy`])
//! - Injectable [`Clock`] so retry timing is testable
//! - In-memory store ([`MemoryOutbox`]) for tests and single-process use

pub mod backend;
pub mod backoff;
pub mod clock;
pub mod job;
pub mod memory;
pub mod status;

pub use backend::{OutboxError, OutboxStats, OutboxStore};
pub use backoff::{BackoffPolicy, FailureOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use job::{FailureClass, JobFailure, JobId, JobState, OutboxJob, TxRef};
pub use memory::MemoryOutbox;
pub use status::{BatchStatus, QuorumPolicy};

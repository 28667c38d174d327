//! Outbox job definitions

use chrono::{DateTime, Utc};
use custody_core::{BatchId, Chain, Hash};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job Identifier
pub type JobId = Uuid;

/// Job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its next attempt
    Queued,
    /// Claimed by a keeper, submission in flight
    Submitting,
    /// Transaction accepted by the chain, awaiting confirmation
    Submitted,
    /// Terminal success
    Confirmed,
    /// Terminal failure, needs an operator
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Submitting => "submitting",
            Self::Submitted => "submitted",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }

    /// Legal edges of the job state machine.
    ///
    /// `Submitted → Queued` is the dropped-transaction demotion; it is only
    /// reachable through `OutboxStore::record_dropped`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Submitting)
                | (Submitting, Submitted)
                | (Submitting, Queued)
                | (Submitting, Failed)
                | (Submitted, Confirmed)
                | (Submitted, Queued)
                | (Submitted, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "submitting" => Ok(Self::Submitting),
            "submitted" => Ok(Self::Submitted),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// How a failure should be treated by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Malformed address or content. Terminal, does not count as an attempt.
    Validation,
    /// Rate limiting, network trouble, timeouts. Retried with backoff.
    Transient,
    /// Insufficient funds, chain rejection. Retried briefly, then terminal.
    Permanent,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

/// A failure reported against a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub class: FailureClass,
    pub message: String,
}

impl JobFailure {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Validation,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            message: message.into(),
        }
    }

    /// Text persisted in `last_error`
    pub fn describe(&self) -> String {
        format!("{}: {}", self.class.as_str(), self.message)
    }
}

/// One anchoring job: a batch root headed for one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxJob {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub chain: Chain,
    pub merkle_root: Hash,
    pub state: JobState,
    /// Provider submissions made so far
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Set while `Submitting`
    pub claimed_at: Option<DateTime<Utc>>,
    /// Returned to the queue by crash recovery or a dropped transaction;
    /// the provider must be asked for an existing anchor before resubmitting
    pub needs_reconcile: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxJob {
    pub fn new(batch_id: BatchId, chain: Chain, merkle_root: Hash, now: DateTime<Utc>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            batch_id,
            chain,
            merkle_root,
            state: JobState::Queued,
            attempt_count: 0,
            next_attempt_at: now,
            last_error: None,
            claimed_at: None,
            needs_reconcile: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.next_attempt_at <= now
    }
}

/// A transaction reference produced by one successful submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef {
    pub job_id: JobId,
    pub chain: Chain,
    pub tx_reference: String,
    pub submitted_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub confirmations: u64,
    /// Dropped or stale; superseded by a later submission
    pub abandoned: bool,
}

impl TxRef {
    pub fn new(job_id: JobId, chain: Chain, tx_reference: impl Into<String>, submitted_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            chain,
            tx_reference: tx_reference.into(),
            submitted_at,
            confirmed_at: None,
            confirmations: 0,
            abandoned: false,
        }
    }
}

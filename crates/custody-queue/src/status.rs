//! Batch-level anchoring status

use custody_core::Chain;
use serde::{Deserialize, Serialize};

use crate::job::{JobState, OutboxJob};

/// How many chains must confirm before a batch counts as fully anchored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QuorumPolicy {
    /// Every targeted chain
    #[default]
    All,
    /// At least this many chains (clamped to the number targeted)
    AtLeast(usize),
}

impl QuorumPolicy {
    pub fn required(&self, targeted: usize) -> usize {
        match self {
            Self::All => targeted,
            Self::AtLeast(n) => (*n).clamp(1, targeted.max(1)),
        }
    }
}

impl std::str::FromStr for QuorumPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "all" | "ALL" => Ok(Self::All),
            n => n
                .parse::<usize>()
                .map(Self::AtLeast)
                .map_err(|_| format!("quorum must be 'all' or a positive integer, got '{n}'")),
        }
    }
}

/// Aggregate anchoring state of one batch across its chains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchStatus {
    /// No chain has confirmed yet, quorum still reachable
    Pending { pending: Vec<Chain> },
    /// Some chains confirmed, the rest are still in progress.
    /// A durable intermediate state, not a failure.
    PartiallyAnchored {
        confirmed: Vec<Chain>,
        pending: Vec<Chain>,
    },
    /// Quorum met
    FullyAnchored { confirmed: Vec<Chain> },
    /// Too many chains failed terminally for the quorum to be met
    Failed {
        confirmed: Vec<Chain>,
        failed: Vec<Chain>,
    },
}

impl BatchStatus {
    pub fn evaluate(jobs: &[OutboxJob], quorum: QuorumPolicy) -> Self {
        let mut confirmed = Vec::new();
        let mut failed = Vec::new();
        let mut pending = Vec::new();
        for job in jobs {
            match job.state {
                JobState::Confirmed => confirmed.push(job.chain),
                JobState::Failed => failed.push(job.chain),
                _ => pending.push(job.chain),
            }
        }
        confirmed.sort();
        failed.sort();
        pending.sort();

        let required = quorum.required(jobs.len());
        if !jobs.is_empty() && confirmed.len() >= required {
            Self::FullyAnchored { confirmed }
        } else if confirmed.len() + pending.len() < required {
            Self::Failed { confirmed, failed }
        } else if confirmed.is_empty() {
            Self::Pending { pending }
        } else {
            Self::PartiallyAnchored { confirmed, pending }
        }
    }

    pub fn is_fully_anchored(&self) -> bool {
        matches!(self, Self::FullyAnchored { .. })
    }
}

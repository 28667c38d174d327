//! Retry backoff policy

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::job::{FailureClass, JobState};

/// Where a failed job goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub state: JobState,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
}

/// Exponential backoff with bounded jitter and attempt limits.
///
/// The delay after the n-th recorded attempt (n >= 1) is
/// `min(base * 2^(n-1) + jitter, cap)` with jitter drawn from
/// `[0, min(jitter, base))`. Keeping jitter below the base delay keeps the
/// sequence non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
    /// Attempts before a transiently failing job becomes `Failed`
    pub max_attempts: u32,
    /// Attempts before a permanently failing job becomes `Failed`
    pub permanent_max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            jitter: Duration::from_millis(500),
            max_attempts: 5,
            permanent_max_attempts: 2,
        }
    }
}

impl BackoffPolicy {
    /// Same policy without jitter (deterministic delays)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = Duration::ZERO;
        self
    }

    /// Deterministic part of the delay
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let millis = (self.base.as_millis() as u64).saturating_mul(1u64 << exp);
        Duration::from_millis(millis).min(self.cap)
    }

    /// Delay including jitter, capped
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let bound = self.jitter.min(self.base).as_millis() as u64;
        let jitter = if bound == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..bound)
        };
        (self.delay(attempt) + Duration::from_millis(jitter)).min(self.cap)
    }

    /// Whether a job with `attempts` recorded attempts may be retried
    pub fn allows_retry(&self, class: FailureClass, attempts: u32) -> bool {
        match class {
            FailureClass::Validation => false,
            FailureClass::Transient => attempts < self.max_attempts,
            FailureClass::Permanent => attempts < self.permanent_max_attempts.min(self.max_attempts),
        }
    }

    /// Resolve a failure reported against a job that had `attempts_before`
    /// recorded attempts. Validation failures never count as an attempt.
    pub fn on_failure(
        &self,
        class: FailureClass,
        attempts_before: u32,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let attempt_count = match class {
            FailureClass::Validation => attempts_before,
            _ => attempts_before.saturating_add(1),
        };
        self.requeue_or_fail(class, attempt_count, now)
    }

    /// Decide between `Queued` (with backoff) and `Failed` for a job that
    /// already has `attempt_count` recorded attempts
    pub fn requeue_or_fail(
        &self,
        class: FailureClass,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        if self.allows_retry(class, attempt_count) {
            let delay = chrono::Duration::from_std(self.jittered_delay(attempt_count))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            FailureOutcome {
                state: JobState::Queued,
                attempt_count,
                next_attempt_at: now + delay,
            }
        } else {
            FailureOutcome {
                state: JobState::Failed,
                attempt_count,
                next_attempt_at: now,
            }
        }
    }
}

//! Provider-scoped rate-limit backoff
//!
//! Separate from the per-job backoff in the outbox: when a chain's RPC
//! endpoint rate-limits us, the whole chain is paused, so no other job for
//! that chain is claimed until the pause ends.

use chrono::{DateTime, Utc};
use custody_core::Chain;
use custody_queue::{BackoffPolicy, Clock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Default, Clone, Copy)]
struct GateState {
    consecutive: u32,
    paused_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct RateLimitGate {
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<HashMap<Chain, GateState>>,
}

impl RateLimitGate {
    /// Default pause schedule: 1s doubling to 30s
    pub fn default_policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            ..BackoffPolicy::default()
        }
    }

    pub fn new(policy: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HashMap<Chain, GateState>) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn is_open(&self, chain: Chain) -> bool {
        let now = self.clock.now();
        self.with_state(|s| {
            s.get(&chain)
                .and_then(|g| g.paused_until)
                .map(|until| until <= now)
                .unwrap_or(true)
        })
    }

    /// Chains from `chains` that are not currently paused
    pub fn open_chains(&self, chains: &[Chain]) -> Vec<Chain> {
        chains.iter().copied().filter(|c| self.is_open(*c)).collect()
    }

    /// Earliest time a paused chain reopens
    pub fn next_open_at(&self, chains: &[Chain]) -> Option<DateTime<Utc>> {
        self.with_state(|s| {
            chains
                .iter()
                .filter_map(|c| s.get(c).and_then(|g| g.paused_until))
                .min()
        })
    }

    /// Pause `chain`. The pause is the longer of the server's `Retry-After`
    /// and our own doubling schedule.
    pub fn note_rate_limited(&self, chain: Chain, retry_after: Option<Duration>) -> DateTime<Utc> {
        let now = self.clock.now();
        let until = self.with_state(|s| {
            let g = s.entry(chain).or_default();
            g.consecutive = g.consecutive.saturating_add(1);
            let ours = self.policy.jittered_delay(g.consecutive);
            let pause = retry_after.map(|r| r.max(ours)).unwrap_or(ours);
            let until = now + chrono::Duration::from_std(pause).unwrap_or(chrono::Duration::seconds(30));
            g.paused_until = Some(until);
            until
        });
        warn!(chain = %chain, until = %until, "Provider rate limited; pausing chain");
        until
    }

    pub fn note_success(&self, chain: Chain) {
        self.with_state(|s| {
            s.remove(&chain);
        });
    }
}

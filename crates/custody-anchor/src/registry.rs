//! Chain → provider lookup with per-chain rate-limit gating

use chrono::{DateTime, Utc};
use custody_core::Chain;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::provider::ChainAnchorProvider;
use crate::throttle::RateLimitGate;

pub struct ProviderRegistry {
    providers: BTreeMap<Chain, Arc<dyn ChainAnchorProvider>>,
    gate: RateLimitGate,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("chains", &self.chains())
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    pub fn new(gate: RateLimitGate) -> Self {
        Self {
            providers: BTreeMap::new(),
            gate,
        }
    }

    /// Register a provider under its own chain, replacing any earlier one
    pub fn register(&mut self, provider: Arc<dyn ChainAnchorProvider>) {
        self.providers.insert(provider.chain(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn ChainAnchorProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, chain: Chain) -> Option<&Arc<dyn ChainAnchorProvider>> {
        self.providers.get(&chain)
    }

    pub fn chains(&self) -> Vec<Chain> {
        self.providers.keys().copied().collect()
    }

    /// Registered chains that are not paused by rate limiting
    pub fn ready_chains(&self) -> Vec<Chain> {
        self.gate.open_chains(&self.chains())
    }

    pub fn next_open_at(&self) -> Option<DateTime<Utc>> {
        self.gate.next_open_at(&self.chains())
    }

    pub fn gate(&self) -> &RateLimitGate {
        &self.gate
    }
}

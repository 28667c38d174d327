//! Keeper configuration
//!
//! Read from `KEEPER_*` and per-chain environment variables. Every keeper
//! key has a default; chain endpoints are only required for the chains the
//! keeper actually targets.

use custody_anchor::{AddressValidator, Commitment, EvmConfig, SolanaConfig};
use custody_core::{AttestationSigner, BatchConfig, Chain};
use custody_persist::SqliteConfig;
use custody_queue::{BackoffPolicy, QuorumPolicy};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::orchestrator::OrchestratorConfig;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Solana endpoint plus the service that signs memo transactions
#[derive(Debug, Clone)]
pub struct SolanaSettings {
    pub config: SolanaConfig,
    /// env: SOLANA_SIGNER_URL
    pub signer_url: String,
}

/// Full keeper configuration
#[derive(Clone)]
pub struct KeeperConfig {
    /// Outbox database (env: KEEPER_DB_URL)
    pub db_url: String,
    /// Idle wait between submit passes (env: KEEPER_POLL_MS)
    pub poll_interval: Duration,
    /// Interval between confirmation passes (env: KEEPER_CONFIRM_POLL_MS)
    pub confirm_poll_interval: Duration,
    /// Job retry schedule and attempt limits
    pub backoff: BackoffPolicy,
    /// Age after which a `Submitting` claim counts as abandoned
    pub recovery_timeout: Duration,
    /// Age after which an unmined transaction counts as dropped
    pub confirm_timeout: Duration,
    /// Deadline for a single provider call
    pub rpc_timeout: Duration,
    pub batch: BatchConfig,
    /// Chains every batch is anchored to (env: KEEPER_CHAINS)
    pub chains: Vec<Chain>,
    pub quorum: QuorumPolicy,
    /// Wire scripted providers instead of real RPC (env: KEEPER_USE_STUB)
    pub use_stub: bool,
    pub evm: Option<EvmConfig>,
    pub solana: Option<SolanaSettings>,
    /// Hex Ed25519 seed (env: ATTESTATION_PRIVATE_KEY)
    pub attestation_key: Option<String>,
    pub attestation_key_id: Option<String>,
}

impl std::fmt::Debug for KeeperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeeperConfig")
            .field("db_url", &self.db_url)
            .field("chains", &self.chains)
            .field("quorum", &self.quorum)
            .field("use_stub", &self.use_stub)
            .field("backoff", &self.backoff)
            .field("evm", &self.evm)
            .field("solana", &self.solana)
            .finish_non_exhaustive()
    }
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            db_url: SqliteConfig::default().url,
            poll_interval: Duration::from_millis(5_000),
            confirm_poll_interval: Duration::from_millis(30_000),
            backoff: BackoffPolicy::default(),
            recovery_timeout: Duration::from_secs(300),
            confirm_timeout: Duration::from_secs(900),
            rpc_timeout: Duration::from_secs(30),
            batch: BatchConfig::default(),
            chains: vec![Chain::Evm],
            quorum: QuorumPolicy::All,
            use_stub: false,
            evm: None,
            solana: None,
            attestation_key: None,
            attestation_key_id: None,
        }
    }
}

impl KeeperConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backoff = BackoffPolicy {
            base: millis(&get, "KEEPER_BACKOFF_BASE_MS", defaults.backoff.base)?,
            cap: millis(&get, "KEEPER_BACKOFF_CAP_MS", defaults.backoff.cap)?,
            jitter: millis(&get, "KEEPER_JITTER_MS", defaults.backoff.jitter)?,
            max_attempts: parse(&get, "KEEPER_MAX_ATTEMPTS", defaults.backoff.max_attempts)?,
            permanent_max_attempts: parse(
                &get,
                "KEEPER_PERMANENT_MAX_ATTEMPTS",
                defaults.backoff.permanent_max_attempts,
            )?,
        };
        if backoff.cap < backoff.base {
            return Err(invalid("KEEPER_BACKOFF_CAP_MS", "cap is below the base delay"));
        }
        if backoff.max_attempts == 0 {
            return Err(invalid("KEEPER_MAX_ATTEMPTS", "must be at least 1"));
        }

        let batch = BatchConfig {
            max_batch_size: parse(&get, "KEEPER_BATCH_MAX_SIZE", defaults.batch.max_batch_size)?,
            max_batch_age: chrono::Duration::seconds(parse(
                &get,
                "KEEPER_BATCH_MAX_AGE_SECS",
                defaults.batch.max_batch_age.num_seconds(),
            )?),
            min_batch_size: parse(&get, "KEEPER_BATCH_MIN_SIZE", defaults.batch.min_batch_size)?,
        };
        if batch.max_batch_size == 0 {
            return Err(invalid("KEEPER_BATCH_MAX_SIZE", "must be at least 1"));
        }

        let chains = match get("KEEPER_CHAINS") {
            Some(raw) => parse_chains(&raw)?,
            None => defaults.chains,
        };
        let quorum = parse(&get, "KEEPER_QUORUM", defaults.quorum)?;
        let rpc_timeout = secs(&get, "KEEPER_RPC_TIMEOUT_SECS", defaults.rpc_timeout)?;
        let recovery_timeout = secs(
            &get,
            "KEEPER_RECOVERY_TIMEOUT_SECS",
            defaults.recovery_timeout,
        )?;
        // A live submission must never look abandoned
        if recovery_timeout <= rpc_timeout * 2 {
            return Err(invalid(
                "KEEPER_RECOVERY_TIMEOUT_SECS",
                format!(
                    "must exceed twice KEEPER_RPC_TIMEOUT_SECS ({}s)",
                    rpc_timeout.as_secs()
                ),
            ));
        }

        let validator = AddressValidator::new();
        let address = |key: &str, chain: Chain, raw: String| {
            validator.validate(chain, &raw).map_err(|e| {
                let format = AddressValidator::describe(chain);
                invalid(key, format!("{} (expected {})", e, format.format))
            })
        };

        let evm = match get("EVM_RPC_URL") {
            Some(url) => {
                let from = get("EVM_FROM_ADDRESS")
                    .ok_or_else(|| ConfigError::MissingEnvVar("EVM_FROM_ADDRESS".into()))?;
                let from = address("EVM_FROM_ADDRESS", Chain::Evm, from)?;
                let mut config = EvmConfig::new(url, from);
                config.to_address = get("EVM_TO_ADDRESS")
                    .map(|to| address("EVM_TO_ADDRESS", Chain::Evm, to))
                    .transpose()?;
                config.confirmations = parse(&get, "EVM_CONFIRMATIONS", config.confirmations)?;
                config.rpc_timeout = rpc_timeout;
                Some(config)
            }
            None => None,
        };

        let solana = match get("SOLANA_RPC_URL") {
            Some(url) => {
                let payer = get("SOLANA_PAYER")
                    .ok_or_else(|| ConfigError::MissingEnvVar("SOLANA_PAYER".into()))?;
                let signer_url = get("SOLANA_SIGNER_URL")
                    .ok_or_else(|| ConfigError::MissingEnvVar("SOLANA_SIGNER_URL".into()))?;
                let payer = address("SOLANA_PAYER", Chain::Solana, payer)?;
                let mut config = SolanaConfig::new(url, payer);
                config.commitment = match get("SOLANA_COMMITMENT").as_deref() {
                    None | Some("finalized") => Commitment::Finalized,
                    Some("confirmed") => Commitment::Confirmed,
                    Some(other) => {
                        return Err(invalid(
                            "SOLANA_COMMITMENT",
                            format!("expected 'confirmed' or 'finalized', got '{other}'"),
                        ))
                    }
                };
                config.rpc_timeout = rpc_timeout;
                Some(SolanaSettings { config, signer_url })
            }
            None => None,
        };

        Ok(Self {
            db_url: get("KEEPER_DB_URL").unwrap_or(defaults.db_url),
            poll_interval: millis(&get, "KEEPER_POLL_MS", defaults.poll_interval)?,
            confirm_poll_interval: millis(
                &get,
                "KEEPER_CONFIRM_POLL_MS",
                defaults.confirm_poll_interval,
            )?,
            backoff,
            recovery_timeout,
            confirm_timeout: secs(&get, "KEEPER_CONFIRM_TIMEOUT_SECS", defaults.confirm_timeout)?,
            rpc_timeout,
            batch,
            chains,
            quorum,
            use_stub: get("KEEPER_USE_STUB").map(|v| is_truthy(&v)).unwrap_or(false),
            evm,
            solana,
            attestation_key: get("ATTESTATION_PRIVATE_KEY"),
            attestation_key_id: get("ATTESTATION_KEY_ID"),
        })
    }

    pub fn sqlite(&self) -> SqliteConfig {
        SqliteConfig::with_url(&self.db_url)
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval: self.poll_interval,
            confirm_poll_interval: self.confirm_poll_interval,
            recovery_timeout: self.recovery_timeout,
            confirm_timeout: self.confirm_timeout,
            call_timeout: self.rpc_timeout,
        }
    }

    /// Signer from `ATTESTATION_PRIVATE_KEY`, or an ephemeral key when unset
    pub fn attestation_signer(&self) -> Result<AttestationSigner, ConfigError> {
        match &self.attestation_key {
            Some(seed) => AttestationSigner::from_seed_hex(seed, self.attestation_key_id.clone())
                .map_err(|e| invalid("ATTESTATION_PRIVATE_KEY", e)),
            None => {
                tracing::warn!("ATTESTATION_PRIVATE_KEY not set; using an ephemeral signing key");
                Ok(AttestationSigner::ephemeral())
            }
        }
    }
}

fn invalid(key: &str, message: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse<G, T>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e| invalid(key, e)),
        None => Ok(default),
    }
}

fn millis<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse(get, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn secs<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse(get, key, default.as_secs()).map(Duration::from_secs)
}

/// Comma-separated chain list, deduplicated in order
pub fn parse_chains(raw: &str) -> Result<Vec<Chain>, ConfigError> {
    let mut chains = Vec::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let chain: Chain = part.parse().map_err(|e| invalid("KEEPER_CHAINS", e))?;
        if !chains.contains(&chain) {
            chains.push(chain);
        }
    }
    if chains.is_empty() {
        return Err(invalid("KEEPER_CHAINS", "no chains listed"));
    }
    Ok(chains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<KeeperConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        KeeperConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.db_url, "sqlite:custody.db?mode=rwc");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.backoff, BackoffPolicy::default());
        assert_eq!(config.chains, vec![Chain::Evm]);
        assert_eq!(config.quorum, QuorumPolicy::All);
        assert_eq!(config.batch.max_batch_size, 100);
        assert!(!config.use_stub);
        assert!(config.evm.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("KEEPER_CHAINS", "evm, solana, evm"),
            ("KEEPER_QUORUM", "1"),
            ("KEEPER_MAX_ATTEMPTS", "7"),
            ("KEEPER_BACKOFF_BASE_MS", "500"),
            ("KEEPER_USE_STUB", "true"),
            ("KEEPER_BATCH_MAX_AGE_SECS", "5"),
            ("EVM_RPC_URL", "http://localhost:8545"),
            ("EVM_FROM_ADDRESS", "0x742d35Cc6634C0532925a3b844Bc454e4438f44e"),
            ("EVM_CONFIRMATIONS", "3"),
            ("KEEPER_RPC_TIMEOUT_SECS", "10"),
        ])
        .unwrap();

        assert_eq!(config.chains, vec![Chain::Evm, Chain::Solana]);
        assert_eq!(config.quorum, QuorumPolicy::AtLeast(1));
        assert_eq!(config.backoff.max_attempts, 7);
        assert_eq!(config.backoff.base, Duration::from_millis(500));
        assert!(config.use_stub);
        assert_eq!(config.batch.max_batch_age, chrono::Duration::seconds(5));

        let evm = config.evm.unwrap();
        assert_eq!(evm.confirmations, 3);
        assert_eq!(evm.rpc_timeout, Duration::from_secs(10));
        assert_eq!(evm.to_address, None);
    }

    #[test]
    fn test_addresses_are_validated_and_normalized() {
        let config = load(&[
            ("EVM_RPC_URL", "http://localhost:8545"),
            ("EVM_FROM_ADDRESS", "0x742d35cc6634c0532925a3b844bc454e4438f44e"),
            ("EVM_TO_ADDRESS", "0x5AAEB6053F3E94C9B9A09F33669435E7EF1BEAED"),
        ])
        .unwrap();
        let evm = config.evm.unwrap();
        assert_eq!(evm.from_address, "0x742d35Cc6634C0532925a3b844Bc454e4438f44e");
        assert_eq!(
            evm.to_address.as_deref(),
            Some("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed")
        );

        let err = load(&[
            ("EVM_RPC_URL", "http://localhost:8545"),
            ("EVM_FROM_ADDRESS", "0x742d35Cc6634C0532925a3b844Bc454e4438f44e"),
            ("EVM_TO_ADDRESS", "0xnot-an-address"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "EVM_TO_ADDRESS"));

        assert!(matches!(
            load(&[
                ("SOLANA_RPC_URL", "http://localhost:8899"),
                ("SOLANA_PAYER", "0OIl"),
                ("SOLANA_SIGNER_URL", "http://localhost:9000"),
            ]),
            Err(ConfigError::Invalid { key, .. }) if key == "SOLANA_PAYER"
        ));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            load(&[("KEEPER_CHAINS", "bitcoin")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            load(&[("KEEPER_POLL_MS", "soon")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            load(&[("KEEPER_BACKOFF_BASE_MS", "5000"), ("KEEPER_BACKOFF_CAP_MS", "1000")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            load(&[("SOLANA_RPC_URL", "http://localhost:8899"), ("SOLANA_PAYER", "x")]),
            Err(ConfigError::MissingEnvVar(var)) if var == "SOLANA_SIGNER_URL"
        ));
        assert!(matches!(
            load(&[
                ("KEEPER_RECOVERY_TIMEOUT_SECS", "5"),
                ("KEEPER_RPC_TIMEOUT_SECS", "60"),
            ]),
            Err(ConfigError::Invalid { key, .. }) if key == "KEEPER_RECOVERY_TIMEOUT_SECS"
        ));
        assert!(matches!(
            load(&[("KEEPER_RECOVERY_TIMEOUT_SECS", "60"), ("KEEPER_RPC_TIMEOUT_SECS", "30")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_attestation_key_from_seed() {
        let seed = "07".repeat(32);
        let config = load(&[
            ("ATTESTATION_PRIVATE_KEY", seed.as_str()),
            ("ATTESTATION_KEY_ID", "keeper-2026"),
        ])
        .unwrap();
        assert_eq!(config.attestation_signer().unwrap().key_id(), "keeper-2026");

        let bad = load(&[("ATTESTATION_PRIVATE_KEY", "zz")]).unwrap();
        assert!(bad.attestation_signer().is_err());
    }
}

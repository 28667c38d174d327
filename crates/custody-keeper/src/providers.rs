//! Provider wiring from configuration

use custody_anchor::{
    EvmAnchorProvider, MockChainProvider, ProviderError, ProviderRegistry, RateLimitGate,
    RemoteMemoSigner, SolanaAnchorProvider,
};
use custody_core::Chain;
use custody_queue::Clock;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{ConfigError, KeeperConfig};

/// Build a registry with one provider per configured chain
pub fn build_registry(
    config: &KeeperConfig,
    clock: Arc<dyn Clock>,
) -> Result<ProviderRegistry, ConfigError> {
    let mut registry = ProviderRegistry::new(RateLimitGate::new(
        RateLimitGate::default_policy(),
        clock,
    ));

    for chain in &config.chains {
        if config.use_stub {
            warn!(chain = %chain, "Using stub provider; nothing is anchored on-chain");
            registry.register(Arc::new(MockChainProvider::new(*chain)));
            continue;
        }

        match chain {
            Chain::Evm => {
                let evm = config
                    .evm
                    .clone()
                    .ok_or_else(|| ConfigError::MissingEnvVar("EVM_RPC_URL".into()))?;
                info!(rpc_url = %evm.rpc_url, from = %evm.from_address, "EVM provider configured");
                let provider = EvmAnchorProvider::new(evm).map_err(provider_error)?;
                registry.register(Arc::new(provider));
            }
            Chain::Solana => {
                let solana = config
                    .solana
                    .clone()
                    .ok_or_else(|| ConfigError::MissingEnvVar("SOLANA_RPC_URL".into()))?;
                info!(rpc_url = %solana.config.rpc_url, payer = %solana.config.payer, "Solana provider configured");
                let signer = RemoteMemoSigner::new(&solana.signer_url, solana.config.rpc_timeout)
                    .map_err(provider_error)?;
                let provider = SolanaAnchorProvider::new(solana.config, Arc::new(signer))
                    .map_err(provider_error)?;
                registry.register(Arc::new(provider));
            }
        }
    }

    Ok(registry)
}

fn provider_error(e: ProviderError) -> ConfigError {
    ConfigError::Invalid {
        key: "provider".into(),
        message: e.to_string(),
    }
}

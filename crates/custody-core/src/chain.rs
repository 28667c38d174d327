//! Supported anchor chains

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// A blockchain an evidence batch can be anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    /// Primary chain: any EVM-compatible network reachable over JSON-RPC
    Evm,
    /// Secondary chain: Solana, anchored through memo transactions
    Solana,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::Evm, Chain::Solana];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evm => "evm",
            Self::Solana => "solana",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "evm" | "ethereum" | "etherlink" => Ok(Self::Evm),
            "solana" | "sol" => Ok(Self::Solana),
            other => Err(ValidationError::UnsupportedChain(other.to_string())),
        }
    }
}

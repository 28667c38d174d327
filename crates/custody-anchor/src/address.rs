//! Chain address validation and normalization
//!
//! EVM addresses are 0x-prefixed 20-byte hex. Mixed-case input must carry a
//! valid EIP-55 checksum; single-case input is accepted unless the validator
//! requires checksums. Solana addresses are base58 and decode to 32 bytes.

use custody_core::{Chain, ValidationError};
use serde::Serialize;
use sha3::{Digest, Keccak256};

/// Human-readable format help for error messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressFormat {
    pub chain: Chain,
    pub format: &'static str,
    pub example: &'static str,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AddressValidator {
    /// Reject single-case EVM addresses
    pub require_checksum: bool,
}

impl AddressValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            require_checksum: true,
        }
    }

    /// Validate `address` for `chain`, returning its normalized form
    pub fn validate(&self, chain: Chain, address: &str) -> Result<String, ValidationError> {
        match chain {
            Chain::Evm => self.validate_evm(address),
            Chain::Solana => validate_solana(address),
        }
    }

    pub fn describe(chain: Chain) -> AddressFormat {
        match chain {
            Chain::Evm => AddressFormat {
                chain,
                format: "0x-prefixed hex (42 chars, 20 bytes), EIP-55 checksum casing",
                example: "0x742d35Cc6634C0532925a3b844Bc454e4438f44e",
            },
            Chain::Solana => AddressFormat {
                chain,
                format: "base58, decodes to exactly 32 bytes",
                example: "4Nd1mY3iQz9dKqG2m9X3pQxvGXn3a6TT5p7H1cDJ5b5P",
            },
        }
    }

    fn validate_evm(&self, address: &str) -> Result<String, ValidationError> {
        let body = address
            .strip_prefix("0x")
            .ok_or_else(|| ValidationError::InvalidPrefix("EVM address must start with 0x".into()))?;

        if address.len() != 42 {
            return Err(ValidationError::InvalidLength {
                expected: 42,
                actual: address.len(),
            });
        }
        if !body.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ValidationError::InvalidCharacters(
                "EVM address contains non-hex characters".into(),
            ));
        }

        let checksummed = to_eip55_checksum(body);
        let has_lower = body.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = body.chars().any(|c| c.is_ascii_uppercase());

        if has_lower && has_upper {
            if checksummed != address {
                return Err(ValidationError::InvalidChecksum(address.to_string()));
            }
        } else if self.require_checksum && (has_lower || has_upper) {
            return Err(ValidationError::InvalidChecksum(format!(
                "{} is not checksummed",
                address
            )));
        }
        Ok(checksummed)
    }
}

fn validate_solana(address: &str) -> Result<String, ValidationError> {
    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|e| ValidationError::Base58(e.to_string()))?;
    if decoded.len() != 32 {
        return Err(ValidationError::InvalidLength {
            expected: 32,
            actual: decoded.len(),
        });
    }
    Ok(address.to_string())
}

/// EIP-55 casing for 40 hex characters (no prefix), returned with `0x`
pub fn to_eip55_checksum(hex_body: &str) -> String {
    let lower = hex_body.to_ascii_lowercase();
    let hash = Keccak256::digest(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let byte = hash[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

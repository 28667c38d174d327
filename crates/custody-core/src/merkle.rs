//! Merkle tree implementation for batch commitments
//!
//! Leaves are evidence digests, used as-is. Each internal node is
//! `SHA-256(left || right)`. When a level has an odd number of nodes the
//! last node is paired with itself, on every level, so the root is a pure
//! function of the ordered leaf list.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

use crate::error::ValidationError;

/// A SHA-256 hash (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Create a hash from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary data
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Combine two hashes (for Merkle tree internal nodes)
    pub fn combine(left: &Hash, right: &Hash) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(left.0);
        hasher.update(right.0);
        Self(hasher.finalize().into())
    }

    /// Get hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self, ValidationError> {
        let bytes = hex::decode(s.trim()).map_err(|e| ValidationError::InvalidHex(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| ValidationError::InvalidLength {
                expected: 32,
                actual: v.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Constant-time equality, used when checking a proof against a root
    pub fn ct_eq(&self, other: &Hash) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// One step of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProofStep {
    /// Sibling hash at this level
    pub hash: Hash,
    /// Whether the sibling sits on the left of the running hash
    pub is_left: bool,
}

/// Inclusion proof for a single leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf: Hash,
    pub leaf_index: usize,
    pub siblings: Vec<MerkleProofStep>,
    pub root: Hash,
}

impl MerkleProof {
    /// Recompute the path from the leaf and compare with `expected_root`
    pub fn verify(&self, expected_root: &Hash) -> bool {
        let mut current = self.leaf;
        for step in &self.siblings {
            current = if step.is_left {
                Hash::combine(&step.hash, &current)
            } else {
                Hash::combine(&current, &step.hash)
            };
        }
        current.ct_eq(expected_root)
    }
}

/// Binary Merkle tree over an ordered list of leaf hashes
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    /// levels[0] are the leaves, the last level holds the root
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Create an empty Merkle tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree bottom-up from ordered leaves
    pub fn from_leaves(leaves: Vec<Hash>) -> Self {
        if leaves.is_empty() {
            return Self::new();
        }

        let mut levels = vec![leaves];
        while let Some(current) = levels.last().filter(|l| l.len() > 1) {
            let next: Vec<Hash> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => Hash::combine(left, right),
                    // Odd cardinality: duplicate the last node
                    [last] => Hash::combine(last, last),
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            levels.push(next);
        }

        Self { levels }
    }

    /// Get the root hash (None if tree is empty)
    pub fn root_hash(&self) -> Option<&Hash> {
        self.levels.last().and_then(|top| top.first())
    }

    /// Get the number of leaves
    pub fn len(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    /// Check if tree is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check whether a hash is one of the leaves
    pub fn contains(&self, target_hash: &Hash) -> bool {
        self.levels
            .first()
            .map(|leaves| leaves.contains(target_hash))
            .unwrap_or(false)
    }

    /// Generate an inclusion proof for the leaf at `index`
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        let leaf = *self.levels.first()?.get(index)?;
        let root = *self.root_hash()?;

        let mut siblings = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            // Past the end means this node was paired with itself
            let hash = level.get(sibling_idx).unwrap_or(&level[idx]);
            siblings.push(MerkleProofStep {
                hash: *hash,
                is_left: idx % 2 == 1,
            });
            idx /= 2;
        }

        Some(MerkleProof {
            leaf,
            leaf_index: index,
            siblings,
            root,
        })
    }
}

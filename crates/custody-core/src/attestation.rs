//! Ed25519 attestations over evidence digests
//!
//! An attestation is available as soon as a record exists, long before any
//! chain confirms the batch it ends up in. The signed payload is
//! `{evidence_id}:{digest_hex}:{signed_at_unix}`.

use chrono::{DateTime, Duration, TimeZone, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::evidence::{EvidenceId, EvidenceRecord};
use crate::merkle::Hash;

const SIGNATURE_PREFIX: &str = "ed25519:";

/// A signature asserting authenticity of an evidence record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub evidence_id: EvidenceId,
    /// `ed25519:<hex>`
    pub signature: String,
    /// Identifier a verifier uses to look up the public key
    pub public_key_id: String,
    pub signed_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// Signs evidence records with an Ed25519 key
#[derive(Clone)]
pub struct AttestationSigner {
    signing_key: SigningKey,
    key_id: String,
    validity: Duration,
}

impl std::fmt::Debug for AttestationSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl AttestationSigner {
    /// Create a signer from a hex-encoded 32-byte seed.
    /// Without an explicit `key_id` one is derived from the public key.
    pub fn from_seed_hex(seed_hex: &str, key_id: Option<String>) -> Result<Self, ValidationError> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| ValidationError::InvalidKey(format!("seed is not hex: {e}")))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            ValidationError::InvalidKey(format!("seed must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&seed), key_id))
    }

    /// Ephemeral key for development and tests
    pub fn ephemeral() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::from_signing_key(signing_key, None)
    }

    fn from_signing_key(signing_key: SigningKey, key_id: Option<String>) -> Self {
        let key_id = key_id.unwrap_or_else(|| derive_key_id(&signing_key.verifying_key()));
        Self {
            signing_key,
            key_id,
            validity: Duration::days(365),
        }
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().as_bytes())
    }

    pub fn sign(&self, record: &EvidenceRecord) -> Attestation {
        self.sign_at(record, Utc::now())
    }

    pub fn sign_at(&self, record: &EvidenceRecord, signed_at: DateTime<Utc>) -> Attestation {
        // Second precision, so the payload is reproducible from the stored timestamp
        let signed_at = Utc
            .timestamp_opt(signed_at.timestamp(), 0)
            .single()
            .unwrap_or(signed_at);
        let payload = signing_payload(&record.id, &record.content_hash, &signed_at);
        let signature = self.signing_key.sign(payload.as_bytes());

        tracing::debug!(evidence_id = %record.id, key_id = %self.key_id, "Evidence attested");

        Attestation {
            evidence_id: record.id,
            signature: format!("{SIGNATURE_PREFIX}{}", hex::encode(signature.to_bytes())),
            public_key_id: self.key_id.clone(),
            signed_at,
            valid_until: signed_at + self.validity,
        }
    }
}

fn derive_key_id(key: &VerifyingKey) -> String {
    format!("ed25519:{}", &Hash::digest(key.as_bytes()).to_hex()[..16])
}

fn signing_payload(id: &EvidenceId, digest: &Hash, signed_at: &DateTime<Utc>) -> String {
    format!("{id}:{}:{}", digest.to_hex(), signed_at.timestamp())
}

/// Verify an attestation against the record it claims to cover.
///
/// Returns `false` for malformed signatures, key mismatches, and records
/// whose id or digest differ from what was signed.
pub fn verify_attestation(
    public_key: &VerifyingKey,
    attestation: &Attestation,
    record: &EvidenceRecord,
) -> bool {
    if attestation.evidence_id != record.id {
        return false;
    }
    let Some(sig_hex) = attestation.signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(sig_arr): Result<[u8; 64], _> = sig_bytes.try_into() else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_arr);
    let payload = signing_payload(&record.id, &record.content_hash, &attestation.signed_at);
    public_key.verify_strict(payload.as_bytes(), &signature).is_ok()
}

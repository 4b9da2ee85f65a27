// src/payload.rs
// Canonical payloads committed to the ledger (agreements and their additional documents),
// and the keys derived from them

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const PAYLOAD_VERSION: u32 = 1;

/// Land sizes are carried as integer micro-acres so the encoding never depends on float formatting.
const MICRO_ACRES_PER_ACRE: f64 = 1_000_000.0;

/// Inputs to canonicalisation, borrowed from an agreement or an API request.
#[derive(Debug, Clone, Copy)]
pub struct AnchorInput<'a> {
    pub agreement_id: &'a str,
    pub farmer1_name: &'a str,
    pub farmer2_name: &'a str,
    pub farmer1_land_size: f64,
    pub farmer2_land_size: f64,
    pub document_cid: &'a str,
}

/// Field order below is the wire order. Do not reorder.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CanonicalPayload {
    pub version: u32,
    pub agreement_id: String,
    pub farmer1_name: String,
    pub farmer2_name: String,
    pub farmer1_land_micro_acres: u64,
    pub farmer2_land_micro_acres: u64,
    pub document_cid: String,
}

impl CanonicalPayload {
    pub fn build(input: &AnchorInput<'_>) -> Result<Self> {
        let required = [
            ("agreement_id", input.agreement_id),
            ("farmer1_name", input.farmer1_name),
            ("farmer2_name", input.farmer2_name),
            ("document_cid", input.document_cid),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(CoreError::IncompleteAgreementData(format!("{} is empty", field)));
            }
        }

        Ok(Self {
            version: PAYLOAD_VERSION,
            agreement_id: input.agreement_id.to_string(),
            farmer1_name: input.farmer1_name.to_string(),
            farmer2_name: input.farmer2_name.to_string(),
            farmer1_land_micro_acres: micro_acres("farmer1_land_size", input.farmer1_land_size)?,
            farmer2_land_micro_acres: micro_acres("farmer2_land_size", input.farmer2_land_size)?,
            document_cid: input.document_cid.to_string(),
        })
    }

    /// Compact JSON in declaration order.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn digest_hex(&self) -> Result<String> {
        Ok(hex::encode(Sha256::digest(self.to_bytes()?)))
    }
}

/// An extra document attached to an already anchored agreement.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DocumentPayload {
    pub version: u32,
    pub agreement_id: String,
    pub document_cid: String,
    pub document_type: String,
}

impl DocumentPayload {
    pub fn build(agreement_id: &str, document_cid: &str, document_type: &str) -> Result<Self> {
        let required = [
            ("agreement_id", agreement_id),
            ("document_cid", document_cid),
            ("document_type", document_type),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(CoreError::IncompleteAgreementData(format!("{} is empty", field)));
            }
        }
        Ok(Self {
            version: PAYLOAD_VERSION,
            agreement_id: agreement_id.to_string(),
            document_cid: document_cid.trim().to_string(),
            document_type: document_type.trim().to_string(),
        })
    }
}

/// Anything a ledger strategy can commit, tagged by `kind` on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerPayload {
    Agreement(CanonicalPayload),
    Document(DocumentPayload),
}

impl LedgerPayload {
    pub fn agreement_id(&self) -> &str {
        match self {
            LedgerPayload::Agreement(p) => &p.agreement_id,
            LedgerPayload::Document(p) => &p.agreement_id,
        }
    }

    /// The bytes that are signed and digested: the inner payload alone, without the tag.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(match self {
            LedgerPayload::Agreement(p) => serde_json::to_vec(p)?,
            LedgerPayload::Document(p) => serde_json::to_vec(p)?,
        })
    }

    pub fn digest_hex(&self) -> Result<String> {
        Ok(hex::encode(Sha256::digest(self.to_bytes()?)))
    }

    /// Key the ledger may use to drop a resubmission of the same commit.
    pub fn idempotency_key(&self) -> String {
        match self {
            LedgerPayload::Agreement(p) => agreement_key(&p.agreement_id),
            LedgerPayload::Document(p) => document_key(&p.agreement_id, &p.document_cid),
        }
    }
}

/// Deterministic key for an agreement: hex(sha256(agreement_id)).
pub fn agreement_key(agreement_id: &str) -> String {
    hex::encode(Sha256::digest(agreement_id.as_bytes()))
}

/// hex(sha256(agreement_id || 0x00 || document_cid))
pub fn document_key(agreement_id: &str, document_cid: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agreement_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(document_cid.as_bytes());
    hex::encode(hasher.finalize())
}

fn micro_acres(field: &str, acres: f64) -> Result<u64> {
    if !acres.is_finite() || acres <= 0.0 {
        return Err(CoreError::IncompleteAgreementData(format!(
            "{} must be positive (got {})",
            field, acres
        )));
    }
    let micro = (acres * MICRO_ACRES_PER_ACRE).round();
    if micro < 1.0 {
        return Err(CoreError::IncompleteAgreementData(format!(
            "{} below one micro-acre",
            field
        )));
    }
    Ok(micro as u64)
}

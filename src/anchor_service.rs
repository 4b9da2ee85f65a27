// src/anchor_service.rs
// Ledger anchoring: one `commit` contract, two strategies (live ledger endpoint, local fallback log).
// The strategy is chosen once, at construction, from the ledger config.

use crate::agreement::{Agreement, AgreementStatus};
use crate::config_manager::LedgerConfig;
use crate::error::{CoreError, LedgerError, Result};
use crate::payload::{agreement_key, AnchorInput, CanonicalPayload, DocumentPayload, LedgerPayload};
use crate::storage::{
    self, RocksDb, AGREEMENT_DOCUMENT_PREFIX, AGREEMENT_PREFIX, FALLBACK_LEDGER_PREFIX,
    FALLBACK_LEDGER_SEQ, RECEIPT_PREFIX,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    Live,
    Fallback,
}

impl fmt::Display for LedgerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerMode::Live => write!(f, "live"),
            LedgerMode::Fallback => write!(f, "fallback"),
        }
    }
}

/// Proof that an agreement's canonical payload was committed. Written once, never updated.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LedgerReceipt {
    pub agreement_id: String,
    pub mode: LedgerMode,
    pub transaction_reference: String,
    /// Absent for the fallback ledger.
    pub block_reference: Option<String>,
    /// sha256 of the canonical payload bytes that were committed
    pub payload_digest: String,
    pub committed_at: DateTime<Utc>,
}

/// An additional document committed against an anchored agreement.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DocumentAnchor {
    pub agreement_id: String,
    pub document_cid: String,
    pub document_type: String,
    pub receipt: LedgerReceipt,
}

/// A ledger strategy. Implementations must not write receipts; the service does that.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    fn mode(&self) -> LedgerMode;

    async fn submit(
        &self,
        agreement_id: &str,
        payload: &LedgerPayload,
    ) -> std::result::Result<LedgerReceipt, LedgerError>;
}

// ---------------------------------------------------------------------------
// Live strategy
// ---------------------------------------------------------------------------

/// Signed submission sent to `{rpc_url}/tx/submit`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LedgerSubmission {
    pub tx_hash: String,
    pub sender: String,
    pub recipient: String,
    pub payload: LedgerPayload,
    pub agreement_key: String,
    pub public_key: String,
    pub signature: String,
    /// Lets the ledger drop a resubmission of the same agreement or document.
    pub idempotency_key: String,
}

#[derive(Deserialize, Debug)]
struct SubmitResponse {
    success: bool,
    #[serde(default)]
    tx_id: String,
    #[serde(default)]
    block: Option<String>,
    message: Option<String>,
}

pub struct LiveLedger {
    client: reqwest::Client,
    submit_url: String,
    signing_key: SigningKey,
    recipient: String,
    timeout: Duration,
}

impl LiveLedger {
    pub fn from_config(config: &LedgerConfig) -> std::result::Result<Self, LedgerError> {
        let rpc_url = config
            .rpc_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LedgerError::Credential("ledger rpc_url missing".into()))?;
        let key_hex = config
            .signing_key_hex
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LedgerError::Credential("ledger signing key missing".into()))?;

        let seed: [u8; 32] = hex::decode(key_hex)
            .map_err(|e| LedgerError::Credential(format!("signing key is not hex: {}", e)))?
            .as_slice()
            .try_into()
            .map_err(|_| LedgerError::Credential("signing key must be 32 bytes".into()))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| LedgerError::Network(e.to_string()))?;

        Ok(Self {
            client,
            submit_url: format!("{}/tx/submit", rpc_url.trim_end_matches('/')),
            signing_key: SigningKey::from_bytes(&seed),
            recipient: config
                .contract_address
                .clone()
                .unwrap_or_else(|| "agreement-registry".to_string()),
            timeout: config.timeout(),
        })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    fn build_submission(
        &self,
        agreement_id: &str,
        payload: &LedgerPayload,
    ) -> std::result::Result<(LedgerSubmission, String), LedgerError> {
        let bytes = payload
            .to_bytes()
            .map_err(|e| LedgerError::Encoding(e.to_string()))?;
        let digest = hex::encode(Sha256::digest(&bytes));
        let signature = self.signing_key.sign(&bytes);

        let submission = LedgerSubmission {
            tx_hash: digest.clone(),
            sender: self.public_key_hex(),
            recipient: self.recipient.clone(),
            payload: payload.clone(),
            agreement_key: agreement_key(agreement_id),
            public_key: self.public_key_hex(),
            signature: hex::encode(signature.to_bytes()),
            idempotency_key: payload.idempotency_key(),
        };
        Ok((submission, digest))
    }
}

#[async_trait]
impl LedgerBackend for LiveLedger {
    fn mode(&self) -> LedgerMode {
        LedgerMode::Live
    }

    async fn submit(
        &self,
        agreement_id: &str,
        payload: &LedgerPayload,
    ) -> std::result::Result<LedgerReceipt, LedgerError> {
        let (submission, digest) = self.build_submission(agreement_id, payload)?;

        let response = self
            .client
            .post(&self.submit_url)
            .json(&submission)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LedgerError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    LedgerError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LedgerError::Credential(format!("ledger answered {}", status)));
        }
        if status.is_server_error() {
            return Err(LedgerError::Network(format!("ledger answered {}", status)));
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::Rejected(format!("{}: {}", status, body)));
        }

        let body: SubmitResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LedgerError::Timeout(self.timeout.as_millis() as u64)
            } else {
                LedgerError::Network(format!("unreadable ledger response: {}", e))
            }
        })?;

        if !body.success || body.tx_id.is_empty() {
            return Err(LedgerError::Rejected(
                body.message.unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }

        Ok(LedgerReceipt {
            agreement_id: agreement_id.to_string(),
            mode: LedgerMode::Live,
            transaction_reference: body.tx_id,
            block_reference: body.block,
            payload_digest: digest,
            committed_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Fallback strategy
// ---------------------------------------------------------------------------

/// One entry of the local append-only ledger.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FallbackEntry {
    pub seq: u64,
    pub agreement_id: String,
    pub payload: LedgerPayload,
    pub payload_digest: String,
    pub appended_at: DateTime<Utc>,
}

pub struct FallbackLedger {
    db: RocksDb,
}

impl FallbackLedger {
    pub fn new(db: RocksDb) -> Self {
        Self { db }
    }

    /// Every entry appended for an agreement, oldest first.
    pub fn entries_for(&self, agreement_id: &str) -> Result<Vec<FallbackEntry>> {
        storage::iter_prefix(&self.db, &format!("{}{}:", FALLBACK_LEDGER_PREFIX, agreement_id))
    }
}

#[async_trait]
impl LedgerBackend for FallbackLedger {
    fn mode(&self) -> LedgerMode {
        LedgerMode::Fallback
    }

    async fn submit(
        &self,
        agreement_id: &str,
        payload: &LedgerPayload,
    ) -> std::result::Result<LedgerReceipt, LedgerError> {
        let digest = payload
            .digest_hex()
            .map_err(|e| LedgerError::Encoding(e.to_string()))?;
        let unavailable = |e: CoreError| LedgerError::StorageUnavailable(e.to_string());

        let seq = storage::increment_counter(&self.db, FALLBACK_LEDGER_SEQ, 1).map_err(unavailable)?;
        let entry = FallbackEntry {
            seq,
            agreement_id: agreement_id.to_string(),
            payload: payload.clone(),
            payload_digest: digest.clone(),
            appended_at: Utc::now(),
        };
        // zero-padded so a prefix scan returns entries in append order
        let key = format!("{}{}:{:020}", FALLBACK_LEDGER_PREFIX, agreement_id, seq);
        storage::put(&self.db, &key, &entry).map_err(unavailable)?;

        log::debug!("Fallback ledger entry #{} for agreement {}", seq, agreement_id);

        Ok(LedgerReceipt {
            agreement_id: agreement_id.to_string(),
            mode: LedgerMode::Fallback,
            transaction_reference: format!("0x{}", digest),
            block_reference: None,
            payload_digest: digest,
            committed_at: entry.appended_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Serialize, Debug, Clone)]
pub struct ModeReport {
    pub mode: LedgerMode,
    pub contract_address: Option<String>,
}

#[derive(Clone)]
pub struct LedgerAnchoringService {
    backend: Arc<dyn LedgerBackend>,
    db: RocksDb,
    contract_address: Option<String>,
    /// Serializes additional-document commits so one (agreement, cid) reaches the ledger once.
    document_lock: Arc<tokio::sync::Mutex<()>>,
}

impl LedgerAnchoringService {
    /// Live mode when both endpoint and signing key are configured, fallback otherwise.
    pub fn from_config(config: &LedgerConfig, db: RocksDb) -> Result<Self> {
        let backend: Arc<dyn LedgerBackend> = if config.has_live_credential() {
            let live = LiveLedger::from_config(config)?;
            log::info!(
                "Ledger anchoring: LIVE via {} (signer {})",
                live.submit_url,
                live.public_key_hex()
            );
            Arc::new(live)
        } else {
            log::warn!("Ledger anchoring: FALLBACK (no live endpoint/credential configured)");
            Arc::new(FallbackLedger::new(db.clone()))
        };

        Ok(Self {
            backend,
            db,
            contract_address: config.contract_address.clone(),
            document_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn with_backend(backend: Arc<dyn LedgerBackend>, db: RocksDb) -> Self {
        Self {
            backend,
            db,
            contract_address: None,
            document_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn get_mode(&self) -> LedgerMode {
        self.backend.mode()
    }

    pub fn mode_report(&self) -> ModeReport {
        ModeReport {
            mode: self.get_mode(),
            contract_address: self.contract_address.clone(),
        }
    }

    /// Commit `payload` for `agreement_id`, at most once.
    ///
    /// An existing receipt is returned untouched; the backend is not called again.
    pub async fn commit(&self, agreement_id: &str, payload: &CanonicalPayload) -> Result<LedgerReceipt> {
        if payload.agreement_id != agreement_id {
            return Err(CoreError::InvalidInput(format!(
                "payload belongs to agreement {}, not {}",
                payload.agreement_id, agreement_id
            )));
        }

        if let Some(existing) = self.receipt(agreement_id)? {
            log::info!(
                "Agreement {} already anchored ({}), returning stored receipt",
                agreement_id,
                existing.transaction_reference
            );
            return Ok(existing);
        }

        let receipt = self
            .backend
            .submit(agreement_id, &LedgerPayload::Agreement(payload.clone()))
            .await?;
        let (stored, wrote) = storage::put_if_absent(&self.db, &receipt_key(agreement_id), &receipt)?;
        if wrote {
            log::info!(
                "Agreement {} anchored [{}] tx={}",
                agreement_id,
                stored.mode,
                stored.transaction_reference
            );
        }
        Ok(stored)
    }

    pub fn receipt(&self, agreement_id: &str) -> Result<Option<LedgerReceipt>> {
        storage::get(&self.db, &receipt_key(agreement_id))
    }

    /// Does the stored receipt commit to this agreement with `document_cid`?
    /// False when nothing has been committed yet.
    pub fn verify(&self, agreement_id: &str, document_cid: &str) -> Result<bool> {
        let receipt = match self.receipt(agreement_id)? {
            Some(r) => r,
            None => return Ok(false),
        };
        let agreement = self.agreement(agreement_id)?;

        let candidate = CanonicalPayload::build(&AnchorInput {
            agreement_id,
            farmer1_name: &agreement.party1.name,
            farmer2_name: &agreement.party2.name,
            farmer1_land_size: agreement.party1.land_size_acres,
            farmer2_land_size: agreement.party2.land_size_acres,
            document_cid,
        })?;
        Ok(candidate.digest_hex()? == receipt.payload_digest)
    }

    /// Commit an additional document (survey, amendment, photo set) for an anchored agreement.
    ///
    /// Idempotent per (agreement, cid): a stored anchor is returned and the ledger is not called.
    pub async fn commit_document(
        &self,
        agreement_id: &str,
        document_cid: &str,
        document_type: &str,
    ) -> Result<DocumentAnchor> {
        let payload = DocumentPayload::build(agreement_id, document_cid, document_type)?;
        let agreement = self.agreement(agreement_id)?;
        if agreement.status != AgreementStatus::Anchored {
            return Err(CoreError::InvalidTransition {
                agreement_id: agreement_id.to_string(),
                from: agreement.status.to_string(),
                action: "anchor an additional document",
            });
        }

        let key = document_anchor_key(agreement_id, &payload.document_cid);
        let _serial = self.document_lock.lock().await;
        if let Some(existing) = storage::get::<DocumentAnchor>(&self.db, &key)? {
            return Ok(existing);
        }

        let receipt = self
            .backend
            .submit(agreement_id, &LedgerPayload::Document(payload.clone()))
            .await?;
        let anchor = DocumentAnchor {
            agreement_id: agreement_id.to_string(),
            document_cid: payload.document_cid,
            document_type: payload.document_type,
            receipt,
        };
        let (stored, wrote) = storage::put_if_absent(&self.db, &key, &anchor)?;
        if wrote {
            log::info!(
                "Agreement {} document {} ({}) anchored [{}] tx={}",
                agreement_id,
                stored.document_cid,
                stored.document_type,
                stored.receipt.mode,
                stored.receipt.transaction_reference
            );
        }
        Ok(stored)
    }

    /// Additional documents of an agreement, oldest commit first.
    pub fn documents_for(&self, agreement_id: &str) -> Result<Vec<DocumentAnchor>> {
        self.agreement(agreement_id)?;
        let mut anchors: Vec<DocumentAnchor> = storage::iter_prefix(
            &self.db,
            &format!("{}{}:", AGREEMENT_DOCUMENT_PREFIX, agreement_id),
        )?;
        anchors.sort_by_key(|a| a.receipt.committed_at);
        Ok(anchors)
    }

    fn agreement(&self, agreement_id: &str) -> Result<Agreement> {
        storage::get(&self.db, &format!("{}{}", AGREEMENT_PREFIX, agreement_id))?
            .ok_or_else(|| CoreError::NotFound(format!("agreement {}", agreement_id)))
    }
}

fn receipt_key(agreement_id: &str) -> String {
    format!("{}{}", RECEIPT_PREFIX, agreement_id)
}

fn document_anchor_key(agreement_id: &str, document_cid: &str) -> String {
    format!("{}{}:{}", AGREEMENT_DOCUMENT_PREFIX, agreement_id, document_cid)
}

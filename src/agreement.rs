// src/agreement.rs
// Agreement lifecycle:
//   drafted -> partially_signed -> fully_signed -> anchoring -> anchored | anchor_failed
//   anchor_failed -> anchoring (manual resubmit)
// Every status write happens under the agreement's own lock.

use crate::anchor_queue::{AnchorJob, AnchorQueue};
use crate::anchor_service::{LedgerMode, LedgerReceipt};
use crate::error::{CoreError, Result};
use crate::payload::{AnchorInput, CanonicalPayload};
use crate::simple_metrics::METRICS;
use crate::storage::{self, RocksDb, AGREEMENT_PREFIX};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgreementStatus {
    Drafted,
    PartiallySigned,
    FullySigned,
    Anchoring,
    Anchored,
    AnchorFailed,
}

impl AgreementStatus {
    pub fn can_transition_to(self, next: AgreementStatus) -> bool {
        use AgreementStatus::*;
        matches!(
            (self, next),
            (Drafted, PartiallySigned)
                | (PartiallySigned, FullySigned)
                | (FullySigned, Anchoring)
                | (Anchoring, Anchored)
                | (Anchoring, AnchorFailed)
                | (AnchorFailed, Anchoring)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AgreementStatus::Anchored | AgreementStatus::AnchorFailed)
    }
}

impl fmt::Display for AgreementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgreementStatus::Drafted => "drafted",
            AgreementStatus::PartiallySigned => "partially_signed",
            AgreementStatus::FullySigned => "fully_signed",
            AgreementStatus::Anchoring => "anchoring",
            AgreementStatus::Anchored => "anchored",
            AgreementStatus::AnchorFailed => "anchor_failed",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Party {
    pub farmer_id: String,
    pub name: String,
    pub land_size_acres: f64,
    pub parcel_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct IntegrationPeriod {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl IntegrationPeriod {
    pub fn validate(&self) -> Result<()> {
        if self.end_date <= self.start_date {
            return Err(CoreError::InvalidIntegrationPeriod);
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SignatureRecord {
    pub farmer_id: String,
    pub signed_at: DateTime<Utc>,
    /// sha256(farmer_id || agreement_id || signed_at rfc3339), hex
    pub signature_hash: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Agreement {
    pub id: String,
    pub party1: Party,
    pub party2: Party,
    pub status: AgreementStatus,
    pub signatures: Vec<SignatureRecord>,
    pub document_cid: Option<String>,
    pub integration_period: Option<IntegrationPeriod>,
    pub source_request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub anchored_at: Option<DateTime<Utc>>,
    pub ledger_reference: Option<String>,
    pub ledger_mode: Option<LedgerMode>,
    pub last_error: Option<String>,
}

impl Agreement {
    pub fn is_party(&self, farmer_id: &str) -> bool {
        self.party1.farmer_id == farmer_id || self.party2.farmer_id == farmer_id
    }

    pub fn has_signed(&self, farmer_id: &str) -> bool {
        self.signatures.iter().any(|s| s.farmer_id == farmer_id)
    }

    /// Percent of the pooled land each party brings; 50/50 when nothing is declared.
    pub fn contribution_ratios(&self) -> (f64, f64) {
        let total = self.party1.land_size_acres + self.party2.land_size_acres;
        if total <= 0.0 {
            return (50.0, 50.0);
        }
        (
            self.party1.land_size_acres / total * 100.0,
            self.party2.land_size_acres / total * 100.0,
        )
    }

    pub fn total_land_acres(&self) -> f64 {
        self.party1.land_size_acres + self.party2.land_size_acres
    }

    /// Canonical payload for the current document. Fails with `MissingDocument` when none is attached.
    pub fn canonical_payload(&self) -> Result<CanonicalPayload> {
        let cid = self
            .document_cid
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or(CoreError::MissingDocument)?;
        CanonicalPayload::build(&AnchorInput {
            agreement_id: &self.id,
            farmer1_name: &self.party1.name,
            farmer2_name: &self.party2.name,
            farmer1_land_size: self.party1.land_size_acres,
            farmer2_land_size: self.party2.land_size_acres,
            document_cid: cid,
        })
    }
}

/// Inputs for a new agreement.
#[derive(Debug, Clone)]
pub struct DraftAgreement {
    pub id: Option<String>,
    pub party1: Party,
    pub party2: Party,
    pub integration_period: Option<IntegrationPeriod>,
    pub source_request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub agreement_id: String,
    pub from: Option<AgreementStatus>,
    pub to: AgreementStatus,
}

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Held while reading and writing one agreement's status.
/// Dropping the last interested guard evicts the agreement's entry from the lock map.
pub struct AgreementGuard {
    agreement_id: String,
    locks: Arc<LockMap>,
    _guard: OwnedMutexGuard<()>,
}

impl AgreementGuard {
    pub fn agreement_id(&self) -> &str {
        &self.agreement_id
    }
}

impl Drop for AgreementGuard {
    fn drop(&mut self) {
        // one handle in the map, one in `_guard`; anything above that is a waiter
        self.locks
            .remove_if(&self.agreement_id, |_, handle| Arc::strong_count(handle) <= 2);
    }
}

#[derive(Clone)]
pub struct AgreementMachine {
    db: RocksDb,
    locks: Arc<LockMap>,
    queue: AnchorQueue,
    events: broadcast::Sender<StatusChange>,
}

impl AgreementMachine {
    pub fn new(db: RocksDb, queue: AnchorQueue) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            db,
            locks: Arc::new(DashMap::new()),
            queue,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    pub async fn lock(&self, agreement_id: &str) -> AgreementGuard {
        let guard = self.lock_handle(agreement_id).lock_owned().await;
        AgreementGuard {
            agreement_id: agreement_id.to_string(),
            locks: self.locks.clone(),
            _guard: guard,
        }
    }

    /// None while someone else (usually an in-flight commit) holds the lock.
    pub fn try_lock(&self, agreement_id: &str) -> Option<AgreementGuard> {
        self.lock_handle(agreement_id)
            .try_lock_owned()
            .ok()
            .map(|guard| AgreementGuard {
                agreement_id: agreement_id.to_string(),
                locks: self.locks.clone(),
                _guard: guard,
            })
    }

    fn lock_handle(&self, agreement_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(agreement_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn get(&self, agreement_id: &str) -> Result<Agreement> {
        storage::get(&self.db, &agreement_db_key(agreement_id))?
            .ok_or_else(|| CoreError::NotFound(format!("agreement {}", agreement_id)))
    }

    pub fn find(&self, agreement_id: &str) -> Result<Option<Agreement>> {
        storage::get(&self.db, &agreement_db_key(agreement_id))
    }

    pub fn all(&self) -> Result<Vec<Agreement>> {
        storage::iter_prefix(&self.db, AGREEMENT_PREFIX)
    }

    pub fn in_status(&self, status: AgreementStatus) -> Result<Vec<Agreement>> {
        Ok(self.all()?.into_iter().filter(|a| a.status == status).collect())
    }

    /// Create an agreement in `drafted`. Both declared land sizes must be positive.
    pub fn draft(&self, draft: DraftAgreement) -> Result<Agreement> {
        let (stored, wrote) = self.insert(draft, AgreementStatus::Drafted, None)?;
        if !wrote {
            return Err(CoreError::InvalidInput(format!(
                "agreement {} already exists",
                stored.id
            )));
        }
        Ok(stored)
    }

    /// Register an agreement whose signatures were captured elsewhere; it starts in `fully_signed`.
    /// Returns the stored record unchanged when the id is already known.
    pub fn register_signed(&self, draft: DraftAgreement, document_cid: &str) -> Result<Agreement> {
        if let Some(id) = draft.id.as_deref() {
            if let Some(existing) = self.find(id)? {
                return Ok(existing);
            }
        }
        if document_cid.trim().is_empty() {
            return Err(CoreError::MissingDocument);
        }
        // a concurrent registration of the same id may land between `find` and here
        let (stored, _) =
            self.insert(draft, AgreementStatus::FullySigned, Some(document_cid.to_string()))?;
        Ok(stored)
    }

    fn insert(
        &self,
        draft: DraftAgreement,
        status: AgreementStatus,
        document_cid: Option<String>,
    ) -> Result<(Agreement, bool)> {
        for party in [&draft.party1, &draft.party2] {
            if !party.land_size_acres.is_finite() || party.land_size_acres <= 0.0 {
                return Err(CoreError::InvalidLandSize(party.land_size_acres));
            }
            if party.farmer_id.trim().is_empty() {
                return Err(CoreError::IncompleteAgreementData("farmer id is empty".into()));
            }
        }
        if draft.party1.farmer_id == draft.party2.farmer_id {
            return Err(CoreError::IncompleteAgreementData(
                "an agreement needs two distinct farmers".into(),
            ));
        }
        if let Some(period) = &draft.integration_period {
            period.validate()?;
        }

        let now = Utc::now();
        let agreement = Agreement {
            id: draft
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            party1: draft.party1,
            party2: draft.party2,
            status,
            signatures: Vec::new(),
            document_cid,
            integration_period: draft.integration_period,
            source_request_id: draft.source_request_id,
            created_at: now,
            updated_at: now,
            anchored_at: None,
            ledger_reference: None,
            ledger_mode: None,
            last_error: None,
        };

        let (stored, wrote) =
            storage::put_if_absent(&self.db, &agreement_db_key(&agreement.id), &agreement)?;
        if !wrote {
            return Ok((stored, false));
        }

        METRICS.inc_agreements_drafted();
        log::info!(
            "Agreement {} created in {} ({} + {}, {:.2} acres)",
            stored.id,
            stored.status,
            stored.party1.farmer_id,
            stored.party2.farmer_id,
            stored.total_land_acres()
        );
        self.publish(&stored.id, None, stored.status);
        Ok((stored, true))
    }

    /// Record a party's signature. Re-signing is a no-op.
    pub async fn record_signature(&self, agreement_id: &str, farmer_id: &str) -> Result<Agreement> {
        let _guard = self.lock(agreement_id).await;
        let mut agreement = self.get(agreement_id)?;

        if !agreement.is_party(farmer_id) {
            return Err(CoreError::NotAParty {
                agreement_id: agreement_id.to_string(),
                farmer_id: farmer_id.to_string(),
            });
        }
        if agreement.has_signed(farmer_id) {
            log::debug!("Farmer {} re-signed agreement {} (ignored)", farmer_id, agreement_id);
            return Ok(agreement);
        }

        let next = match agreement.status {
            AgreementStatus::Drafted => AgreementStatus::PartiallySigned,
            AgreementStatus::PartiallySigned => AgreementStatus::FullySigned,
            other => {
                return Err(CoreError::InvalidTransition {
                    agreement_id: agreement_id.to_string(),
                    from: other.to_string(),
                    action: "sign",
                })
            }
        };

        let signed_at = Utc::now();
        agreement.signatures.push(SignatureRecord {
            farmer_id: farmer_id.to_string(),
            signed_at,
            signature_hash: signature_hash(farmer_id, agreement_id, &signed_at),
        });
        self.transition(&mut agreement, next)?;
        log::info!("Farmer {} signed agreement {}", farmer_id, agreement_id);
        Ok(agreement)
    }

    /// Attach the signed document and move `fully_signed -> anchoring`, then queue the commit.
    pub async fn begin_anchoring(&self, agreement_id: &str, document_cid: &str) -> Result<Agreement> {
        let (agreement, job) = {
            let _guard = self.lock(agreement_id).await;
            let mut agreement = self.get(agreement_id)?;

            if agreement.status != AgreementStatus::FullySigned {
                return Err(CoreError::InvalidTransition {
                    agreement_id: agreement_id.to_string(),
                    from: agreement.status.to_string(),
                    action: "begin anchoring",
                });
            }
            if document_cid.trim().is_empty() {
                return Err(CoreError::MissingDocument);
            }

            agreement.document_cid = Some(document_cid.to_string());
            let payload = agreement.canonical_payload()?;
            self.transition(&mut agreement, AgreementStatus::Anchoring)?;
            let job = AnchorJob::new(agreement_id, payload);
            (agreement, job)
        };

        // a closed queue leaves the agreement in `anchoring`; the startup sweep re-queues it
        self.queue.enqueue(job).await?;
        Ok(agreement)
    }

    /// Move `anchor_failed -> anchoring` and queue a fresh job.
    /// Refused while a commit for the agreement still holds its lock.
    pub async fn resubmit(&self, agreement_id: &str) -> Result<Agreement> {
        let (agreement, job) = {
            let _guard = self
                .try_lock(agreement_id)
                .ok_or_else(|| CoreError::AnchoringInFlight(agreement_id.to_string()))?;
            let mut agreement = self.get(agreement_id)?;

            if agreement.status != AgreementStatus::AnchorFailed {
                return Err(CoreError::InvalidTransition {
                    agreement_id: agreement_id.to_string(),
                    from: agreement.status.to_string(),
                    action: "resubmit",
                });
            }
            let payload = agreement.canonical_payload()?;
            agreement.last_error = None;
            self.transition(&mut agreement, AgreementStatus::Anchoring)?;
            (agreement, AnchorJob::new(agreement_id, payload))
        };

        log::info!("Agreement {} resubmitted for anchoring", agreement_id);
        self.queue.enqueue(job).await?;
        Ok(agreement)
    }

    pub async fn mark_anchored(&self, agreement_id: &str, receipt: &LedgerReceipt) -> Result<Agreement> {
        let guard = self.lock(agreement_id).await;
        self.mark_anchored_locked(&guard, receipt)
    }

    pub async fn mark_anchor_failed(&self, agreement_id: &str, reason: &str) -> Result<Agreement> {
        let guard = self.lock(agreement_id).await;
        self.mark_anchor_failed_locked(&guard, reason)
    }

    /// Same as `mark_anchored`, for a caller already holding the agreement lock.
    pub fn mark_anchored_locked(
        &self,
        guard: &AgreementGuard,
        receipt: &LedgerReceipt,
    ) -> Result<Agreement> {
        let mut agreement = self.anchoring(guard.agreement_id())?;
        agreement.ledger_reference = Some(receipt.transaction_reference.clone());
        agreement.ledger_mode = Some(receipt.mode);
        agreement.anchored_at = Some(receipt.committed_at);
        agreement.last_error = None;
        self.transition(&mut agreement, AgreementStatus::Anchored)?;
        Ok(agreement)
    }

    pub fn mark_anchor_failed_locked(&self, guard: &AgreementGuard, reason: &str) -> Result<Agreement> {
        let mut agreement = self.anchoring(guard.agreement_id())?;
        agreement.last_error = Some(reason.to_string());
        self.transition(&mut agreement, AgreementStatus::AnchorFailed)?;
        Ok(agreement)
    }

    /// Wait until the agreement leaves `anchoring` or `budget` elapses, then return its record.
    pub async fn wait_settled(&self, agreement_id: &str, budget: Duration) -> Result<Agreement> {
        let mut events = self.subscribe();
        let deadline = tokio::time::Instant::now() + budget;

        loop {
            let current = self.get(agreement_id)?;
            if current.status.is_terminal() {
                return Ok(current);
            }
            loop {
                match tokio::time::timeout_at(deadline, events.recv()).await {
                    Err(_) => return self.get(agreement_id),
                    Ok(Ok(change)) if change.agreement_id == agreement_id && change.to.is_terminal() => {
                        break
                    }
                    Ok(Ok(_)) => continue,
                    // lagged: re-read the record
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => break,
                    Ok(Err(broadcast::error::RecvError::Closed)) => return self.get(agreement_id),
                }
            }
        }
    }

    fn anchoring(&self, agreement_id: &str) -> Result<Agreement> {
        let agreement = self.get(agreement_id)?;
        if agreement.status != AgreementStatus::Anchoring {
            return Err(CoreError::NotAnchoring(agreement_id.to_string()));
        }
        Ok(agreement)
    }

    fn transition(&self, agreement: &mut Agreement, next: AgreementStatus) -> Result<()> {
        let from = agreement.status;
        if !from.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                agreement_id: agreement.id.clone(),
                from: from.to_string(),
                action: "transition",
            });
        }
        agreement.status = next;
        agreement.updated_at = Utc::now();
        storage::put(&self.db, &agreement_db_key(&agreement.id), agreement)?;

        log::info!("Agreement {}: {} -> {}", agreement.id, from, next);
        self.publish(&agreement.id, Some(from), next);
        Ok(())
    }

    fn publish(&self, agreement_id: &str, from: Option<AgreementStatus>, to: AgreementStatus) {
        // no subscribers is fine
        let _ = self.events.send(StatusChange {
            agreement_id: agreement_id.to_string(),
            from,
            to,
        });
    }
}

pub fn signature_hash(farmer_id: &str, agreement_id: &str, signed_at: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(farmer_id.as_bytes());
    hasher.update(agreement_id.as_bytes());
    hasher.update(signed_at.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}

fn agreement_db_key(id: &str) -> String {
    format!("{}{}", AGREEMENT_PREFIX, id)
}

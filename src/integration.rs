// src/integration.rs
// Integration request ledger: directional requests between farmers, the target's
// accept/reject response, and time-based expiry. Records are never deleted.

use crate::agreement::{Agreement, AgreementMachine, DraftAgreement, IntegrationPeriod, Party};
use crate::error::{CoreError, Result};
use crate::land::{self, Candidate, LandParcel, ParcelRegistry};
use crate::simple_metrics::METRICS;
use crate::storage::{self, RocksDb, REQUEST_PREFIX};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Reject,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IntegrationRequest {
    pub id: String,
    pub requesting_farmer_id: String,
    pub target_farmer_id: String,
    pub requester_parcel_id: String,
    pub target_parcel_id: String,
    pub status: RequestStatus,
    pub request_date: DateTime<Utc>,
    pub response_date: Option<DateTime<Utc>>,
    pub integration_period: Option<IntegrationPeriod>,
    /// Set once the request is accepted.
    pub agreement_id: Option<String>,
}

impl IntegrationRequest {
    fn same_tuple(&self, new: &NewRequest) -> bool {
        self.requesting_farmer_id == new.requester_id
            && self.target_farmer_id == new.target_id
            && self.requester_parcel_id == new.requester_parcel_id
            && self.target_parcel_id == new.target_parcel_id
    }

    fn counterpart_of(&self, farmer_id: &str) -> Option<&str> {
        if self.requesting_farmer_id == farmer_id {
            Some(&self.target_farmer_id)
        } else if self.target_farmer_id == farmer_id {
            Some(&self.requesting_farmer_id)
        } else {
            None
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct NewRequest {
    pub requester_id: String,
    pub target_id: String,
    pub requester_parcel_id: String,
    pub target_parcel_id: String,
    #[serde(default)]
    pub integration_period: Option<IntegrationPeriod>,
}

#[derive(Serialize, Debug, Clone)]
pub struct RespondOutcome {
    pub request: IntegrationRequest,
    /// The drafted agreement, on accept.
    pub agreement: Option<Agreement>,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct RequestListing {
    pub sent: Vec<IntegrationRequest>,
    pub received: Vec<IntegrationRequest>,
}

#[derive(Clone)]
pub struct IntegrationLedger {
    db: RocksDb,
    parcels: ParcelRegistry,
    agreements: AgreementMachine,
    max_distance_m: f64,
    // serialises duplicate checks against inserts, and responses against expiry
    write_lock: Arc<Mutex<()>>,
}

impl IntegrationLedger {
    pub fn new(
        db: RocksDb,
        parcels: ParcelRegistry,
        agreements: AgreementMachine,
        max_distance_m: f64,
    ) -> Self {
        Self {
            db,
            parcels,
            agreements,
            max_distance_m,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn parcels(&self) -> &ParcelRegistry {
        &self.parcels
    }

    pub fn get(&self, request_id: &str) -> Result<IntegrationRequest> {
        storage::get(&self.db, &request_key(request_id))?
            .ok_or_else(|| CoreError::NotFound(format!("integration request {}", request_id)))
    }

    pub fn all(&self) -> Result<Vec<IntegrationRequest>> {
        storage::iter_prefix(&self.db, REQUEST_PREFIX)
    }

    pub fn create_request(&self, new: NewRequest) -> Result<IntegrationRequest> {
        if new.requester_id == new.target_id {
            return Err(CoreError::SelfRequest);
        }
        if let Some(period) = &new.integration_period {
            period.validate()?;
        }

        let requester_parcel = self.parcels.get(&new.requester_parcel_id)?;
        if requester_parcel.farmer_id != new.requester_id {
            return Err(CoreError::NotAuthorized(format!(
                "farmer {} does not own parcel {}",
                new.requester_id, new.requester_parcel_id
            )));
        }
        let target_parcel = self.parcels.get(&new.target_parcel_id)?;
        if target_parcel.farmer_id != new.target_id {
            return Err(CoreError::InvalidInput(format!(
                "parcel {} does not belong to farmer {}",
                new.target_parcel_id, new.target_id
            )));
        }
        for parcel in [&requester_parcel, &target_parcel] {
            if parcel.locked_by_agreement.is_some() {
                return Err(CoreError::ParcelLocked(parcel.id.clone()));
            }
        }

        let _w = self.write_lock.lock();
        let duplicate = self
            .all()?
            .iter()
            .any(|r| r.status == RequestStatus::Pending && r.same_tuple(&new));
        if duplicate {
            return Err(CoreError::DuplicatePending);
        }

        let request = IntegrationRequest {
            id: Uuid::new_v4().to_string(),
            requesting_farmer_id: new.requester_id,
            target_farmer_id: new.target_id,
            requester_parcel_id: new.requester_parcel_id,
            target_parcel_id: new.target_parcel_id,
            status: RequestStatus::Pending,
            request_date: Utc::now(),
            response_date: None,
            integration_period: new.integration_period,
            agreement_id: None,
        };
        storage::put(&self.db, &request_key(&request.id), &request)?;

        METRICS.inc_requests_created();
        log::info!(
            "Integration request {} created: {} -> {}",
            request.id,
            request.requesting_farmer_id,
            request.target_farmer_id
        );
        Ok(request)
    }

    /// Target farmer accepts or rejects. Accepting drafts the agreement and locks both parcels.
    pub fn respond(&self, request_id: &str, responder_id: &str, decision: Decision) -> Result<RespondOutcome> {
        let _w = self.write_lock.lock();
        let mut request = self.get(request_id)?;

        if request.target_farmer_id != responder_id {
            return Err(CoreError::NotAuthorized(format!(
                "farmer {} is not the target of request {}",
                responder_id, request_id
            )));
        }
        if request.status != RequestStatus::Pending {
            return Err(CoreError::AlreadyResolved(request_id.to_string()));
        }

        let agreement = match decision {
            Decision::Reject => {
                request.status = RequestStatus::Rejected;
                None
            }
            Decision::Accept => {
                let requester_parcel = self.parcels.get(&request.requester_parcel_id)?;
                let target_parcel = self.parcels.get(&request.target_parcel_id)?;
                // another accept may have claimed a parcel since this request was created
                for parcel in [&requester_parcel, &target_parcel] {
                    if parcel.locked_by_agreement.is_some() {
                        return Err(CoreError::ParcelLocked(parcel.id.clone()));
                    }
                }
                let agreement = self.agreements.draft(DraftAgreement {
                    id: None,
                    party1: party_from(&requester_parcel),
                    party2: party_from(&target_parcel),
                    integration_period: request.integration_period,
                    source_request_id: Some(request.id.clone()),
                })?;
                self.parcels.lock_for_agreement(
                    &[requester_parcel.id.as_str(), target_parcel.id.as_str()],
                    &agreement.id,
                )?;
                request.status = RequestStatus::Accepted;
                request.agreement_id = Some(agreement.id.clone());
                Some(agreement)
            }
        };

        request.response_date = Some(Utc::now());
        storage::put(&self.db, &request_key(&request.id), &request)?;
        log::info!(
            "Integration request {}: pending -> {} (by {})",
            request.id,
            request.status,
            responder_id
        );

        Ok(RespondOutcome { request, agreement })
    }

    /// Move every pending request older than `ttl` to `expired`. Returns how many changed.
    pub fn expire_stale(&self, now: DateTime<Utc>, ttl: ChronoDuration) -> Result<usize> {
        let _w = self.write_lock.lock();
        let stale: Vec<(String, IntegrationRequest)> = self
            .all()?
            .into_iter()
            .filter(|r| r.status == RequestStatus::Pending && now - r.request_date > ttl)
            .map(|mut r| {
                r.status = RequestStatus::Expired;
                r.response_date = Some(now);
                (request_key(&r.id), r)
            })
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }
        storage::batch_put(&self.db, &stale)?;
        for (_, r) in &stale {
            log::info!("Integration request {}: pending -> expired", r.id);
        }
        Ok(stale.len())
    }

    /// Requests a farmer sent and received, newest first.
    pub fn list_for_farmer(&self, farmer_id: &str) -> Result<RequestListing> {
        let mut listing = RequestListing::default();
        for r in self.all()? {
            if r.requesting_farmer_id == farmer_id {
                listing.sent.push(r);
            } else if r.target_farmer_id == farmer_id {
                listing.received.push(r);
            }
        }
        listing.sent.sort_by(|a, b| b.request_date.cmp(&a.request_date));
        listing.received.sort_by(|a, b| b.request_date.cmp(&a.request_date));
        Ok(listing)
    }

    /// Farmers tied to `farmer_id` by a pending or accepted request, in either direction.
    pub fn linked_farmers(&self, farmer_id: &str) -> Result<HashSet<String>> {
        Ok(self
            .all()?
            .iter()
            .filter(|r| matches!(r.status, RequestStatus::Pending | RequestStatus::Accepted))
            .filter_map(|r| r.counterpart_of(farmer_id).map(str::to_string))
            .collect())
    }

    pub fn find_candidates(&self, farmer_id: &str, parcel_id: &str) -> Result<Vec<Candidate>> {
        let parcels: Vec<LandParcel> = self.parcels.all()?;
        let linked = self.linked_farmers(farmer_id)?;
        land::find_candidates(farmer_id, parcel_id, &parcels, &linked, self.max_distance_m)
    }

    pub fn candidates_for_farmer(&self, farmer_id: &str) -> Result<Vec<Candidate>> {
        let parcels: Vec<LandParcel> = self.parcels.all()?;
        let linked = self.linked_farmers(farmer_id)?;
        land::candidates_for_farmer(farmer_id, &parcels, &linked, self.max_distance_m)
    }
}

/// Periodically expire stale pending requests.
pub fn spawn_expiry_sweeper(ledger: IntegrationLedger, ttl: ChronoDuration, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        log::info!(
            "Request expiry sweeper started (ttl={}h, interval={}s)",
            ttl.num_hours(),
            every.as_secs()
        );
        loop {
            ticker.tick().await;
            let l = ledger.clone();
            let swept = tokio::task::spawn_blocking(move || l.expire_stale(Utc::now(), ttl)).await;
            match swept {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => log::info!("Expired {} stale integration request(s)", n),
                Ok(Err(e)) => log::warn!("Expiry sweep failed: {}", e),
                Err(e) => log::error!("Expiry sweep task panicked: {}", e),
            }
        }
    })
}

fn party_from(parcel: &LandParcel) -> Party {
    Party {
        farmer_id: parcel.farmer_id.clone(),
        name: parcel.display_name(),
        land_size_acres: parcel.area_acres,
        parcel_id: Some(parcel.id.clone()),
    }
}

fn request_key(id: &str) -> String {
    format!("{}{}", REQUEST_PREFIX, id)
}

// src/land/mod.rs
// Mapped land parcels and the registry that owns them

pub mod matcher;

use crate::error::{CoreError, Result};
use crate::storage::{self, RocksDb, PARCEL_PREFIX};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use matcher::{candidates_for_farmer, find_candidates, haversine_m, Candidate};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude)
        {
            return Err(CoreError::InvalidInput(format!(
                "coordinate ({}, {}) out of range",
                self.latitude, self.longitude
            )));
        }
        Ok(())
    }
}

/// Land-record survey details as extracted from the farmer's documents.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyMetadata {
    pub survey_number: Option<String>,
    pub village: Option<String>,
    pub taluk: Option<String>,
    pub district: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LandParcel {
    pub id: String,
    pub farmer_id: String,
    pub owner_name: String,
    pub boundary: Vec<GeoPoint>,
    pub centroid: GeoPoint,
    pub area_acres: f64,
    pub survey: SurveyMetadata,
    pub ready_to_integrate: bool,
    pub ready_since: Option<DateTime<Utc>>,
    /// Set while an agreement built on this parcel is alive; the parcel is then immutable.
    pub locked_by_agreement: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LandParcel {
    /// Name shown to the other party; falls back to a short farmer tag.
    pub fn display_name(&self) -> String {
        if !self.owner_name.trim().is_empty() {
            return self.owner_name.clone();
        }
        let tail: String = self
            .farmer_id
            .chars()
            .rev()
            .take(6)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("Farmer {}", tail)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewParcel {
    pub farmer_id: String,
    #[serde(default)]
    pub owner_name: String,
    #[serde(default)]
    pub boundary: Vec<GeoPoint>,
    /// Computed from the boundary when omitted.
    pub centroid: Option<GeoPoint>,
    pub area_acres: f64,
    #[serde(default)]
    pub survey: SurveyMetadata,
}

/// Vertex average of a boundary ring.
pub fn centroid_of(boundary: &[GeoPoint]) -> Option<GeoPoint> {
    if boundary.is_empty() {
        return None;
    }
    let n = boundary.len() as f64;
    let (lat, lon) = boundary
        .iter()
        .fold((0.0, 0.0), |(lat, lon), p| (lat + p.latitude, lon + p.longitude));
    Some(GeoPoint::new(lat / n, lon / n))
}

#[derive(Clone)]
pub struct ParcelRegistry {
    db: RocksDb,
}

impl ParcelRegistry {
    pub fn new(db: RocksDb) -> Self {
        Self { db }
    }

    pub fn register(&self, new: NewParcel) -> Result<LandParcel> {
        if new.farmer_id.trim().is_empty() {
            return Err(CoreError::InvalidInput("farmer_id is required".into()));
        }
        if !(new.area_acres > 0.0) || !new.area_acres.is_finite() {
            return Err(CoreError::InvalidLandSize(new.area_acres));
        }
        let centroid = new
            .centroid
            .or_else(|| centroid_of(&new.boundary))
            .ok_or_else(|| CoreError::InvalidInput("centroid or boundary is required".into()))?;
        centroid.validate()?;
        for p in &new.boundary {
            p.validate()?;
        }

        let parcel = LandParcel {
            id: Uuid::new_v4().to_string(),
            farmer_id: new.farmer_id,
            owner_name: new.owner_name,
            boundary: new.boundary,
            centroid,
            area_acres: new.area_acres,
            survey: new.survey,
            ready_to_integrate: false,
            ready_since: None,
            locked_by_agreement: None,
            created_at: Utc::now(),
        };
        self.save(&parcel)?;
        log::info!(
            "Registered parcel {} for farmer {} ({:.2} acres)",
            parcel.id,
            parcel.farmer_id,
            parcel.area_acres
        );
        Ok(parcel)
    }

    pub fn get(&self, parcel_id: &str) -> Result<LandParcel> {
        storage::get(&self.db, &parcel_key(parcel_id))?
            .ok_or_else(|| CoreError::NotFound(format!("parcel {}", parcel_id)))
    }

    pub fn save(&self, parcel: &LandParcel) -> Result<()> {
        storage::put(&self.db, &parcel_key(&parcel.id), parcel)
    }

    pub fn all(&self) -> Result<Vec<LandParcel>> {
        storage::iter_prefix(&self.db, PARCEL_PREFIX)
    }

    pub fn list_for_farmer(&self, farmer_id: &str) -> Result<Vec<LandParcel>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|p| p.farmer_id == farmer_id)
            .collect())
    }

    /// Owner toggles whether the parcel is offered for integration.
    pub fn set_ready(&self, farmer_id: &str, parcel_id: &str, ready: bool) -> Result<LandParcel> {
        let mut parcel = self.owned(farmer_id, parcel_id)?;
        if ready && parcel.locked_by_agreement.is_some() {
            return Err(CoreError::ParcelLocked(parcel.id));
        }
        parcel.ready_to_integrate = ready;
        parcel.ready_since = if ready { Some(Utc::now()) } else { None };
        self.save(&parcel)?;
        log::info!(
            "Parcel {} ready_to_integrate = {} (farmer {})",
            parcel.id,
            ready,
            farmer_id
        );
        Ok(parcel)
    }

    /// Re-survey a parcel. Refused while an agreement references it.
    pub fn update_survey(
        &self,
        farmer_id: &str,
        parcel_id: &str,
        boundary: Vec<GeoPoint>,
        area_acres: f64,
    ) -> Result<LandParcel> {
        let mut parcel = self.owned(farmer_id, parcel_id)?;
        if parcel.locked_by_agreement.is_some() {
            return Err(CoreError::ParcelLocked(parcel.id));
        }
        if !(area_acres > 0.0) || !area_acres.is_finite() {
            return Err(CoreError::InvalidLandSize(area_acres));
        }
        for p in &boundary {
            p.validate()?;
        }
        if let Some(c) = centroid_of(&boundary) {
            parcel.centroid = c;
        }
        parcel.boundary = boundary;
        parcel.area_acres = area_acres;
        self.save(&parcel)?;
        Ok(parcel)
    }

    /// Pin parcels to a freshly drafted agreement and withdraw them from matching.
    pub fn lock_for_agreement(&self, parcel_ids: &[&str], agreement_id: &str) -> Result<()> {
        let mut entries = Vec::with_capacity(parcel_ids.len());
        for id in parcel_ids {
            let mut parcel = self.get(id)?;
            if matches!(&parcel.locked_by_agreement, Some(other) if other != agreement_id) {
                return Err(CoreError::ParcelLocked(parcel.id));
            }
            parcel.ready_to_integrate = false;
            parcel.ready_since = None;
            parcel.locked_by_agreement = Some(agreement_id.to_string());
            entries.push((parcel_key(&parcel.id), parcel));
        }
        storage::batch_put(&self.db, &entries)
    }

    fn owned(&self, farmer_id: &str, parcel_id: &str) -> Result<LandParcel> {
        let parcel = self.get(parcel_id)?;
        if parcel.farmer_id != farmer_id {
            return Err(CoreError::NotAuthorized(format!(
                "farmer {} does not own parcel {}",
                farmer_id, parcel_id
            )));
        }
        Ok(parcel)
    }
}

fn parcel_key(id: &str) -> String {
    format!("{}{}", PARCEL_PREFIX, id)
}

// src/land/matcher.rs
// Land adjacency matching over ready-to-integrate parcels.
// Pure functions of the parcel snapshot they are given; no I/O.

use super::{GeoPoint, LandParcel};
use crate::error::{CoreError, Result};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Candidate {
    pub candidate_farmer_id: String,
    pub candidate_farmer_name: String,
    pub candidate_parcel_id: String,
    pub area_acres: f64,
    /// Centroid distance in metres; lower is better.
    pub distance_score: f64,
    #[serde(skip)]
    created_at: chrono::DateTime<chrono::Utc>,
}

/// Great-circle distance between two points in metres.
pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Rank parcels near `parcel_id` for `farmer_id`.
///
/// The source parcel must exist, belong to the farmer and be ready to integrate,
/// otherwise `NotEligible`. `linked_farmers` holds farmers already tied to this
/// farmer by a pending or accepted request; their parcels are skipped.
pub fn find_candidates(
    farmer_id: &str,
    parcel_id: &str,
    parcels: &[LandParcel],
    linked_farmers: &HashSet<String>,
    max_distance_m: f64,
) -> Result<Vec<Candidate>> {
    let source = parcels
        .iter()
        .find(|p| p.id == parcel_id && p.farmer_id == farmer_id && p.ready_to_integrate)
        .ok_or_else(|| CoreError::NotEligible(parcel_id.to_string()))?;

    let mut out: Vec<Candidate> = parcels
        .iter()
        .filter(|p| p.ready_to_integrate && p.locked_by_agreement.is_none())
        .filter(|p| p.farmer_id != farmer_id)
        .filter(|p| !linked_farmers.contains(&p.farmer_id))
        .filter_map(|p| {
            let distance = haversine_m(&source.centroid, &p.centroid);
            (distance <= max_distance_m).then(|| Candidate {
                candidate_farmer_id: p.farmer_id.clone(),
                candidate_farmer_name: p.display_name(),
                candidate_parcel_id: p.id.clone(),
                area_acres: p.area_acres,
                distance_score: distance,
                created_at: p.created_at,
            })
        })
        .collect();

    out.sort_by(rank);
    Ok(out)
}

/// Candidates across every ready parcel the farmer owns, best score per candidate parcel.
/// A farmer with nothing ready gets an empty list rather than an error.
pub fn candidates_for_farmer(
    farmer_id: &str,
    parcels: &[LandParcel],
    linked_farmers: &HashSet<String>,
    max_distance_m: f64,
) -> Result<Vec<Candidate>> {
    let mut best: HashMap<String, Candidate> = HashMap::new();

    let own_ready = parcels
        .iter()
        .filter(|p| p.farmer_id == farmer_id && p.ready_to_integrate);
    for source in own_ready {
        for c in find_candidates(farmer_id, &source.id, parcels, linked_farmers, max_distance_m)? {
            match best.get(&c.candidate_parcel_id) {
                Some(existing) if existing.distance_score <= c.distance_score => {}
                _ => {
                    best.insert(c.candidate_parcel_id.clone(), c);
                }
            }
        }
    }

    let mut out: Vec<Candidate> = best.into_values().collect();
    out.sort_by(rank);
    Ok(out)
}

// distance, then older parcel first, then id for total determinism
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    a.distance_score
        .total_cmp(&b.distance_score)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.candidate_parcel_id.cmp(&b.candidate_parcel_id))
}

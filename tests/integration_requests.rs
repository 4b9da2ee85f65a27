// tests/integration_requests.rs
// Request ledger rules and candidate matching over a real store

mod common;

use agri_anchor::error::CoreError;
use agri_anchor::integration::{Decision, NewRequest, RequestStatus};
use agri_anchor::land::LandParcel;
use common::{fallback_node, ready_parcel};

fn request(from: (&str, &LandParcel), to: (&str, &LandParcel)) -> NewRequest {
    NewRequest {
        requester_id: from.0.to_string(),
        target_id: to.0.to_string(),
        requester_parcel_id: from.1.id.clone(),
        target_parcel_id: to.1.id.clone(),
        integration_period: None,
    }
}

#[test]
fn duplicate_pending_then_rerequest_after_rejection() {
    let (_dir, node) = fallback_node();
    let a = ready_parcel(&node, "farmer-a", 12.0, 77.0, 2.0);
    let b = ready_parcel(&node, "farmer-b", 12.001, 77.0, 2.0);

    let first = node
        .integration
        .create_request(request(("farmer-a", &a), ("farmer-b", &b)))
        .unwrap();
    assert!(matches!(
        node.integration
            .create_request(request(("farmer-a", &a), ("farmer-b", &b))),
        Err(CoreError::DuplicatePending)
    ));

    let outcome = node
        .integration
        .respond(&first.id, "farmer-b", Decision::Reject)
        .unwrap();
    assert_eq!(outcome.request.status, RequestStatus::Rejected);
    assert!(outcome.request.response_date.is_some());
    assert!(outcome.agreement.is_none());

    let second = node
        .integration
        .create_request(request(("farmer-a", &a), ("farmer-b", &b)))
        .unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.status, RequestStatus::Pending);

    // the rejected record is kept
    assert_eq!(node.integration.get(&first.id).unwrap().status, RequestStatus::Rejected);
}

#[test]
fn only_target_may_respond_once() {
    let (_dir, node) = fallback_node();
    let a = ready_parcel(&node, "farmer-a", 12.0, 77.0, 2.0);
    let b = ready_parcel(&node, "farmer-b", 12.001, 77.0, 2.0);
    let req = node
        .integration
        .create_request(request(("farmer-a", &a), ("farmer-b", &b)))
        .unwrap();

    assert!(matches!(
        node.integration.respond(&req.id, "farmer-a", Decision::Accept),
        Err(CoreError::NotAuthorized(_))
    ));

    let outcome = node
        .integration
        .respond(&req.id, "farmer-b", Decision::Accept)
        .unwrap();
    let agreement = outcome.agreement.unwrap();
    assert_eq!(outcome.request.agreement_id.as_deref(), Some(agreement.id.as_str()));
    assert_eq!(agreement.party1.farmer_id, "farmer-a");
    assert_eq!(agreement.party2.land_size_acres, 2.0);

    assert!(matches!(
        node.integration.respond(&req.id, "farmer-b", Decision::Reject),
        Err(CoreError::AlreadyResolved(_))
    ));
}

#[test]
fn self_requests_and_foreign_parcels_are_refused() {
    let (_dir, node) = fallback_node();
    let a = ready_parcel(&node, "farmer-a", 12.0, 77.0, 2.0);
    let b = ready_parcel(&node, "farmer-b", 12.001, 77.0, 2.0);

    assert!(matches!(
        node.integration
            .create_request(request(("farmer-a", &a), ("farmer-a", &a))),
        Err(CoreError::SelfRequest)
    ));
    // requester claims a parcel it does not own
    assert!(matches!(
        node.integration
            .create_request(request(("farmer-a", &b), ("farmer-b", &b))),
        Err(CoreError::NotAuthorized(_))
    ));
}

#[test]
fn accepted_parcels_are_locked() {
    let (_dir, node) = fallback_node();
    let a = ready_parcel(&node, "farmer-a", 12.0, 77.0, 2.0);
    let b = ready_parcel(&node, "farmer-b", 12.001, 77.0, 2.0);
    let c = ready_parcel(&node, "farmer-c", 12.002, 77.0, 2.0);

    let req = node
        .integration
        .create_request(request(("farmer-a", &a), ("farmer-b", &b)))
        .unwrap();
    node.integration
        .respond(&req.id, "farmer-b", Decision::Accept)
        .unwrap();

    assert!(matches!(
        node.integration
            .create_request(request(("farmer-c", &c), ("farmer-a", &a))),
        Err(CoreError::ParcelLocked(_))
    ));
    assert!(matches!(
        node.parcels.set_ready("farmer-a", &a.id, true),
        Err(CoreError::ParcelLocked(_))
    ));
}

#[test]
fn second_accept_on_a_claimed_parcel_is_refused() {
    let (_dir, node) = fallback_node();
    let a = ready_parcel(&node, "farmer-a", 12.0, 77.0, 2.0);
    let b = ready_parcel(&node, "farmer-b", 12.001, 77.0, 2.0);
    let c = ready_parcel(&node, "farmer-c", 12.002, 77.0, 2.0);

    // both requests target the same parcel while it is still free
    let from_a = node
        .integration
        .create_request(request(("farmer-a", &a), ("farmer-b", &b)))
        .unwrap();
    let from_c = node
        .integration
        .create_request(request(("farmer-c", &c), ("farmer-b", &b)))
        .unwrap();

    let accepted = node
        .integration
        .respond(&from_a.id, "farmer-b", Decision::Accept)
        .unwrap();
    let agreement_id = accepted.agreement.unwrap().id;

    assert!(matches!(
        node.integration.respond(&from_c.id, "farmer-b", Decision::Accept),
        Err(CoreError::ParcelLocked(id)) if id == b.id
    ));
    assert_eq!(
        node.parcels.get(&b.id).unwrap().locked_by_agreement.as_deref(),
        Some(agreement_id.as_str())
    );
    assert!(node.parcels.get(&c.id).unwrap().locked_by_agreement.is_none());
    assert_eq!(node.integration.get(&from_c.id).unwrap().status, RequestStatus::Pending);

    // the losing request can still be turned down
    node.integration
        .respond(&from_c.id, "farmer-b", Decision::Reject)
        .unwrap();
}

#[test]
fn stale_pending_requests_expire() {
    let (_dir, node) = fallback_node();
    let a = ready_parcel(&node, "farmer-a", 12.0, 77.0, 2.0);
    let b = ready_parcel(&node, "farmer-b", 12.001, 77.0, 2.0);
    let req = node
        .integration
        .create_request(request(("farmer-a", &a), ("farmer-b", &b)))
        .unwrap();

    let ttl = chrono::Duration::hours(1);
    assert_eq!(node.integration.expire_stale(chrono::Utc::now(), ttl).unwrap(), 0);

    let later = chrono::Utc::now() + chrono::Duration::hours(2);
    assert_eq!(node.integration.expire_stale(later, ttl).unwrap(), 1);
    assert_eq!(node.integration.get(&req.id).unwrap().status, RequestStatus::Expired);
    assert!(matches!(
        node.integration.respond(&req.id, "farmer-b", Decision::Accept),
        Err(CoreError::AlreadyResolved(_))
    ));

    let listing = node.integration.list_for_farmer("farmer-b").unwrap();
    assert!(listing.sent.is_empty());
    assert_eq!(listing.received.len(), 1);
}

#[test]
fn candidates_ranked_by_distance_within_radius() {
    let (_dir, node) = fallback_node();
    let mine = ready_parcel(&node, "farmer-a", 12.0, 77.0, 2.0);
    // roughly 333m, 111m and 1.1km north
    ready_parcel(&node, "farmer-c", 12.003, 77.0, 1.0);
    ready_parcel(&node, "farmer-b", 12.001, 77.0, 1.5);
    ready_parcel(&node, "farmer-d", 12.010, 77.0, 4.0);
    // a second parcel of my own never shows up
    ready_parcel(&node, "farmer-a", 12.0005, 77.0, 1.0);

    let found = node.integration.find_candidates("farmer-a", &mine.id).unwrap();
    let farmers: Vec<&str> = found.iter().map(|c| c.candidate_farmer_id.as_str()).collect();
    assert_eq!(farmers, vec!["farmer-b", "farmer-c"]);
    assert!(found[0].distance_score < found[1].distance_score);
    assert!((found[0].distance_score - 111.2).abs() < 1.0);
    assert_eq!(found[0].candidate_farmer_name, "farmer-b name");
}

#[test]
fn no_neighbours_means_empty_list() {
    let (_dir, node) = fallback_node();
    let mine = ready_parcel(&node, "farmer-a", 12.0, 77.0, 2.0);
    ready_parcel(&node, "farmer-far", 13.0, 77.0, 2.0);

    assert!(node.integration.find_candidates("farmer-a", &mine.id).unwrap().is_empty());
}

#[test]
fn linked_farmers_drop_out_of_matching() {
    let (_dir, node) = fallback_node();
    let a = ready_parcel(&node, "farmer-a", 12.0, 77.0, 2.0);
    let b = ready_parcel(&node, "farmer-b", 12.001, 77.0, 2.0);
    ready_parcel(&node, "farmer-c", 12.002, 77.0, 2.0);

    let req = node
        .integration
        .create_request(request(("farmer-a", &a), ("farmer-b", &b)))
        .unwrap();
    let found = node.integration.find_candidates("farmer-a", &a.id).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].candidate_farmer_id, "farmer-c");

    // rejection frees the pair again
    node.integration
        .respond(&req.id, "farmer-b", Decision::Reject)
        .unwrap();
    assert_eq!(node.integration.find_candidates("farmer-a", &a.id).unwrap().len(), 2);
}

#[test]
fn parcel_must_be_ready_to_search() {
    let (_dir, node) = fallback_node();
    let a = ready_parcel(&node, "farmer-a", 12.0, 77.0, 2.0);
    ready_parcel(&node, "farmer-b", 12.001, 77.0, 2.0);
    node.parcels.set_ready("farmer-a", &a.id, false).unwrap();

    // farmer-level search with nothing ready is simply empty
    assert!(node.integration.candidates_for_farmer("farmer-a").unwrap().is_empty());

    assert!(matches!(
        node.integration.find_candidates("farmer-a", &a.id),
        Err(CoreError::NotEligible(_))
    ));
    assert!(matches!(
        node.integration.find_candidates("farmer-b", &a.id),
        Err(CoreError::NotEligible(_))
    ));
}

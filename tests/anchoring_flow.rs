// tests/anchoring_flow.rs
// End-to-end agreement lifecycle against the fallback ledger and scripted ledgers

mod common;

use agri_anchor::agreement::{AgreementStatus, DraftAgreement, Party};
use agri_anchor::anchor_service::LedgerMode;
use agri_anchor::error::{CoreError, LedgerError};
use agri_anchor::integration::{Decision, NewRequest};
use agri_anchor::AgriNode;
use common::{fallback_node, node_with, ready_parcel, started, ScriptedLedger};
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(5);

/// Request, accept, sign twice. Returns the agreement id.
async fn signed_agreement(node: &AgriNode) -> String {
    let a = ready_parcel(node, "farmer-a", 12.9716, 77.5946, 2.0);
    let b = ready_parcel(node, "farmer-b", 12.9726, 77.5946, 3.0);

    let request = node
        .integration
        .create_request(NewRequest {
            requester_id: "farmer-a".into(),
            target_id: "farmer-b".into(),
            requester_parcel_id: a.id.clone(),
            target_parcel_id: b.id.clone(),
            integration_period: None,
        })
        .unwrap();
    let outcome = node
        .integration
        .respond(&request.id, "farmer-b", Decision::Accept)
        .unwrap();
    let agreement = outcome.agreement.expect("accept drafts an agreement");
    assert_eq!(agreement.status, AgreementStatus::Drafted);

    node.agreements
        .record_signature(&agreement.id, "farmer-a")
        .await
        .unwrap();
    let signed = node
        .agreements
        .record_signature(&agreement.id, "farmer-b")
        .await
        .unwrap();
    assert_eq!(signed.status, AgreementStatus::FullySigned);
    agreement.id
}

#[tokio::test]
async fn fallback_anchors_accepted_request() {
    let (_dir, node) = started(fallback_node()).await;
    assert_eq!(node.anchoring.get_mode(), LedgerMode::Fallback);

    let id = signed_agreement(&node).await;
    let anchoring = node.agreements.begin_anchoring(&id, "cid123").await.unwrap();
    assert_eq!(anchoring.status, AgreementStatus::Anchoring);

    let settled = node.agreements.wait_settled(&id, SETTLE).await.unwrap();
    assert_eq!(settled.status, AgreementStatus::Anchored);
    assert_eq!(settled.ledger_mode, Some(LedgerMode::Fallback));
    let reference = settled.ledger_reference.expect("anchored agreements carry a reference");
    assert!(reference.starts_with("0x") && reference.len() > 2);

    let receipt = node.anchoring.receipt(&id).unwrap().unwrap();
    assert_eq!(receipt.transaction_reference, reference);
    assert!(node.anchoring.verify(&id, "cid123").unwrap());
    assert!(!node.anchoring.verify(&id, "cid124").unwrap());

    // both parcels stay pinned to the agreement
    for parcel in node.parcels.all().unwrap() {
        assert_eq!(parcel.locked_by_agreement.as_deref(), Some(id.as_str()));
    }
}

#[tokio::test]
async fn status_changes_are_observed_in_order() {
    let (_dir, node) = started(fallback_node()).await;
    let mut events = node.agreements.subscribe();

    let id = signed_agreement(&node).await;
    node.agreements.begin_anchoring(&id, "cid123").await.unwrap();

    let mut seen = Vec::new();
    loop {
        let change = tokio::time::timeout(SETTLE, events.recv())
            .await
            .expect("status change within budget")
            .unwrap();
        assert_eq!(change.agreement_id, id);
        seen.push(change.to);
        if change.to.is_terminal() {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![
            AgreementStatus::Drafted,
            AgreementStatus::PartiallySigned,
            AgreementStatus::FullySigned,
            AgreementStatus::Anchoring,
            AgreementStatus::Anchored,
        ]
    );
}

#[tokio::test]
async fn timeouts_exhaust_attempts_then_fail() {
    let ledger = ScriptedLedger::always(LedgerError::Timeout(1_000));
    let (_dir, node) = started(node_with(ledger.clone())).await;

    let id = signed_agreement(&node).await;
    node.agreements.begin_anchoring(&id, "cid123").await.unwrap();

    let settled = node.agreements.wait_settled(&id, SETTLE).await.unwrap();
    assert_eq!(settled.status, AgreementStatus::AnchorFailed);
    assert!(settled.ledger_reference.is_none());
    assert!(settled.last_error.unwrap().contains("timed out"));
    assert_eq!(ledger.calls(), 3);
    assert!(node.anchoring.receipt(&id).unwrap().is_none());
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let ledger = ScriptedLedger::failing(2, LedgerError::Network("connection reset".into()));
    let (_dir, node) = started(node_with(ledger.clone())).await;

    let id = signed_agreement(&node).await;
    node.agreements.begin_anchoring(&id, "cid123").await.unwrap();

    let settled = node.agreements.wait_settled(&id, SETTLE).await.unwrap();
    assert_eq!(settled.status, AgreementStatus::Anchored);
    assert_eq!(settled.ledger_reference.as_deref(), Some("0xscripted3"));
    assert_eq!(ledger.calls(), 3);
}

#[tokio::test]
async fn rejected_transaction_is_not_retried() {
    let ledger = ScriptedLedger::always(LedgerError::Rejected("bad payload".into()));
    let (_dir, node) = started(node_with(ledger.clone())).await;

    let id = signed_agreement(&node).await;
    node.agreements.begin_anchoring(&id, "cid123").await.unwrap();

    let settled = node.agreements.wait_settled(&id, SETTLE).await.unwrap();
    assert_eq!(settled.status, AgreementStatus::AnchorFailed);
    assert_eq!(ledger.calls(), 1);
}

#[tokio::test]
async fn resubmit_after_failure_anchors() {
    // three failures use up the first round; the resubmitted job succeeds
    let ledger = ScriptedLedger::failing(3, LedgerError::Timeout(1_000));
    let (_dir, node) = started(node_with(ledger.clone())).await;

    let id = signed_agreement(&node).await;
    node.agreements.begin_anchoring(&id, "cid123").await.unwrap();
    let failed = node.agreements.wait_settled(&id, SETTLE).await.unwrap();
    assert_eq!(failed.status, AgreementStatus::AnchorFailed);

    // the worker publishes the failure just before releasing the agreement lock
    let resubmitted = loop {
        match node.agreements.resubmit(&id).await {
            Err(CoreError::AnchoringInFlight(_)) => tokio::time::sleep(Duration::from_millis(5)).await,
            other => break other.unwrap(),
        }
    };
    assert_eq!(resubmitted.status, AgreementStatus::Anchoring);
    assert!(resubmitted.last_error.is_none());

    let settled = node.agreements.wait_settled(&id, SETTLE).await.unwrap();
    assert_eq!(settled.status, AgreementStatus::Anchored);
    assert_eq!(ledger.calls(), 4);
}

#[tokio::test]
async fn resubmit_refused_unless_failed() {
    let (_dir, node) = started(fallback_node()).await;
    let id = signed_agreement(&node).await;

    assert!(matches!(
        node.agreements.resubmit(&id).await,
        Err(CoreError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn anchoring_requires_full_signatures_and_document() {
    let (_dir, node) = started(fallback_node()).await;
    let draft = node
        .agreements
        .draft(DraftAgreement {
            id: Some("agr-unsigned".into()),
            party1: party("farmer-a", 1.0),
            party2: party("farmer-b", 1.5),
            integration_period: None,
            source_request_id: None,
        })
        .unwrap();

    assert!(matches!(
        node.agreements.begin_anchoring(&draft.id, "cid123").await,
        Err(CoreError::InvalidTransition { .. })
    ));

    node.agreements.record_signature(&draft.id, "farmer-a").await.unwrap();
    node.agreements.record_signature(&draft.id, "farmer-b").await.unwrap();
    assert!(matches!(
        node.agreements.begin_anchoring(&draft.id, "  ").await,
        Err(CoreError::MissingDocument)
    ));
    assert_eq!(
        node.agreements.get(&draft.id).unwrap().status,
        AgreementStatus::FullySigned
    );
}

#[tokio::test]
async fn outsiders_cannot_sign() {
    let (_dir, node) = started(fallback_node()).await;
    let id = signed_agreement(&node).await;

    assert!(matches!(
        node.agreements.record_signature(&id, "farmer-z").await,
        Err(CoreError::NotAParty { .. })
    ));
}

#[tokio::test]
async fn startup_sweep_requeues_anchoring_agreements() {
    let ledger = ScriptedLedger::failing(0, LedgerError::Timeout(1));
    let (_dir, mut node) = node_with(ledger.clone());

    // queued before any worker runs, as if left over from a previous process
    let id = signed_agreement(&node).await;
    node.agreements.begin_anchoring(&id, "cid123").await.unwrap();
    assert_eq!(node.agreements.get(&id).unwrap().status, AgreementStatus::Anchoring);

    node.start().await.unwrap();
    let settled = node.agreements.wait_settled(&id, SETTLE).await.unwrap();
    assert_eq!(settled.status, AgreementStatus::Anchored);

    // the original job and the rebuilt one both ran; only one reached the ledger
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ledger.calls(), 1);
}

#[tokio::test]
async fn commit_is_idempotent_per_agreement() {
    let ledger = ScriptedLedger::failing(0, LedgerError::Timeout(1));
    let (_dir, node) = node_with(ledger.clone());
    let id = signed_agreement(&node).await;
    let payload = {
        let mut agreement = node.agreements.get(&id).unwrap();
        agreement.document_cid = Some("cid123".into());
        agreement.canonical_payload().unwrap()
    };

    let first = node.anchoring.commit(&id, &payload).await.unwrap();
    let second = node.anchoring.commit(&id, &payload).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(ledger.calls(), 1);

    assert!(matches!(
        node.anchoring.commit("someone-else", &payload).await,
        Err(CoreError::InvalidInput(_))
    ));
}

fn party(id: &str, acres: f64) -> Party {
    Party {
        farmer_id: id.to_string(),
        name: id.to_string(),
        land_size_acres: acres,
        parcel_id: None,
    }
}

#[tokio::test]
async fn additional_documents_anchor_once_per_cid() {
    let ledger = ScriptedLedger::failing(0, LedgerError::Network("unused".into()));
    let (_dir, node) = started(node_with(ledger.clone())).await;
    let id = signed_agreement(&node).await;

    // only anchored agreements take extra documents
    assert!(matches!(
        node.anchoring.commit_document(&id, "cid-survey", "survey").await,
        Err(CoreError::InvalidTransition { .. })
    ));
    assert!(matches!(
        node.anchoring.commit_document("agr-unknown", "cid-survey", "survey").await,
        Err(CoreError::NotFound(_))
    ));

    node.agreements.begin_anchoring(&id, "cid123").await.unwrap();
    let settled = node.agreements.wait_settled(&id, SETTLE).await.unwrap();
    assert_eq!(settled.status, AgreementStatus::Anchored);
    assert_eq!(ledger.calls(), 1);

    assert!(matches!(
        node.anchoring.commit_document(&id, "cid-survey", "").await,
        Err(CoreError::IncompleteAgreementData(_))
    ));

    let survey = node
        .anchoring
        .commit_document(&id, "cid-survey", "survey")
        .await
        .unwrap();
    assert_eq!(survey.document_type, "survey");
    assert_eq!(survey.receipt.agreement_id, id);
    assert_eq!(ledger.calls(), 2);

    // same cid again: stored anchor, no second ledger call
    let again = node
        .anchoring
        .commit_document(&id, "cid-survey", "survey")
        .await
        .unwrap();
    assert_eq!(again, survey);
    assert_eq!(ledger.calls(), 2);

    node.anchoring
        .commit_document(&id, "cid-photos", "photos")
        .await
        .unwrap();
    let listed = node.anchoring.documents_for(&id).unwrap();
    let cids: Vec<&str> = listed.iter().map(|d| d.document_cid.as_str()).collect();
    assert_eq!(cids, vec!["cid-survey", "cid-photos"]);

    // the agreement's own receipt is untouched
    assert!(node.anchoring.verify(&id, "cid123").unwrap());
    assert_ne!(
        node.anchoring.receipt(&id).unwrap().unwrap().payload_digest,
        survey.receipt.payload_digest
    );
}

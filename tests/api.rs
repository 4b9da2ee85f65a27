// tests/api.rs
// HTTP surface, driven through the router without a socket

mod common;

use agri_anchor::api::{self, ApiKeys};
use agri_anchor::AgriNode;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{fallback_node, ready_parcel, started};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app(node: &AgriNode) -> Router {
    api::router(node.app_state(), ApiKeys::default())
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)))
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn agreement_body(id: &str) -> Value {
    json!({
        "agreementId": id,
        "farmer1Name": "Ravi",
        "farmer2Name": "Meena",
        "farmer1LandSize": 2.5,
        "farmer2LandSize": 1.5,
        "documentContentId": "cid123",
    })
}

#[tokio::test]
async fn health_and_mode_are_public() {
    let (_dir, node) = fallback_node();
    let app = api::router(node.app_state(), ApiKeys(Arc::new(vec!["secret".into()])));

    let (status, body) = call(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call(&app, get("/ledger/mode")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "fallback");
}

#[tokio::test]
async fn protected_routes_need_a_key() {
    let (_dir, node) = fallback_node();
    let app = api::router(node.app_state(), ApiKeys(Arc::new(vec!["secret".into()])));

    let (status, _) = call(&app, get("/agreements/nope")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::get("/agreements/nope")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    assert_eq!(call(&app, req).await.0, StatusCode::UNAUTHORIZED);

    let req = Request::get("/agreements/nope")
        .header(header::AUTHORIZATION, "Bearer secret")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotFound");
}

#[tokio::test]
async fn create_agreement_anchors_and_repeats_idempotently() {
    let (_dir, node) = started(fallback_node()).await;
    let app = app(&node);

    let (status, body) = call(&app, post("/agreements", agreement_body("agr-1"))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["agreementId"], "agr-1");
    assert_eq!(body["mode"], "fallback");
    assert_eq!(body["status"], "anchored");
    let reference = body["ledgerReference"].as_str().unwrap().to_string();
    assert!(!reference.is_empty());

    let (status, again) = call(&app, post("/agreements", agreement_body("agr-1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["ledgerReference"], reference.as_str());

    let (status, progress) = call(&app, get("/agreements/agr-1/anchoring")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["status"], "anchored");
    assert_eq!(progress["ledgerReference"], reference.as_str());

    let (_, detail) = call(&app, get("/agreements/agr-1")).await;
    assert_eq!(detail["total_land_acres"], 4.0);
    assert_eq!(detail["contribution_ratios"]["party1"], 62.5);

    let (_, verified) = call(&app, get("/agreements/agr-1/verify?document_cid=cid123")).await;
    assert_eq!(verified["verified"], true);
}

#[tokio::test]
async fn farmers_sharing_a_name_can_agree() {
    let (_dir, node) = started(fallback_node()).await;
    let app = app(&node);

    let body = json!({
        "agreementId": "agr-namesake",
        "farmer1Name": "Ravi Kumar",
        "farmer2Name": "Ravi Kumar",
        "farmer1LandSize": 2.0,
        "farmer2LandSize": 3.0,
        "documentContentId": "cid123",
    });
    let (status, created) = call(&app, post("/agreements", body)).await;
    assert_eq!(status, StatusCode::OK, "{}", created);
    assert_eq!(created["status"], "anchored");

    let (_, detail) = call(&app, get("/agreements/agr-namesake")).await;
    let agreement = &detail["agreement"];
    assert_eq!(agreement["party1"]["name"], "Ravi Kumar");
    assert_eq!(agreement["party2"]["name"], "Ravi Kumar");
    assert_ne!(agreement["party1"]["farmer_id"], agreement["party2"]["farmer_id"]);
}

#[tokio::test]
async fn additional_documents_over_http() {
    let (_dir, node) = started(fallback_node()).await;
    let app = app(&node);

    let doc = json!({ "document_cid": "cid-survey", "document_type": "survey" });
    let (status, err) = call(&app, post("/agreements/agr-docs/documents", doc.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"], "NotFound");

    let (status, _) = call(&app, post("/agreements", agreement_body("agr-docs"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, anchor) = call(&app, post("/agreements/agr-docs/documents", doc.clone())).await;
    assert_eq!(status, StatusCode::CREATED, "{}", anchor);
    assert_eq!(anchor["document_type"], "survey");
    assert_eq!(anchor["receipt"]["mode"], "fallback");
    let reference = anchor["receipt"]["transaction_reference"].clone();

    let (status, again) = call(&app, post("/agreements/agr-docs/documents", doc)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(again["receipt"]["transaction_reference"], reference);

    let missing_type = json!({ "document_cid": "cid-photos", "document_type": "" });
    let (status, err) = call(&app, post("/agreements/agr-docs/documents", missing_type)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "IncompleteAgreementData");

    let (status, listing) = call(&app, get("/agreements/agr-docs/documents")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["count"], 1);
    assert_eq!(listing["documents"][0]["document_cid"], "cid-survey");
}

#[tokio::test]
async fn create_agreement_validates_input() {
    let (_dir, node) = started(fallback_node()).await;
    let app = app(&node);

    let mut body = agreement_body("agr-bad");
    body["farmer2LandSize"] = json!(0);
    let (status, err) = call(&app, post("/agreements", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "InvalidLandSize");

    let mut body = agreement_body("agr-bad");
    body["documentContentId"] = json!("");
    let (status, err) = call(&app, post("/agreements", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "MissingDocument");

    let mut body = agreement_body("agr-bad");
    body["farmer1Name"] = json!(" ");
    let (status, err) = call(&app, post("/agreements", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "IncompleteAgreementData");

    // nothing was stored for the rejected submissions
    assert_eq!(call(&app, get("/agreements/agr-bad")).await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn request_flow_over_http() {
    let (_dir, node) = started(fallback_node()).await;
    let a = ready_parcel(&node, "farmer-a", 12.0, 77.0, 2.0);
    let b = ready_parcel(&node, "farmer-b", 12.001, 77.0, 3.0);
    let app = app(&node);

    let (status, found) = call(
        &app,
        get(&format!("/land/candidates?farmer_id=farmer-a&parcel_id={}", a.id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["count"], 1);
    assert_eq!(found["candidates"][0]["candidate_parcel_id"], b.id.as_str());

    let new_request = json!({
        "requesterId": "farmer-a",
        "targetId": "farmer-b",
        "requesterParcelId": a.id,
        "targetParcelId": b.id,
    });
    let (status, created) = call(&app, post("/integration/requests", new_request.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "pending");

    let (status, err) = call(&app, post("/integration/requests", new_request)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"], "DuplicatePending");

    let respond = json!({
        "requestId": created["id"],
        "responderId": "farmer-b",
        "decision": "accept",
    });
    let (status, outcome) = call(&app, post("/integration/respond", respond)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["request"]["status"], "accepted");
    let agreement_id = outcome["agreement"]["id"].as_str().unwrap().to_string();

    for farmer in ["farmer-a", "farmer-b"] {
        let (status, _) = call(
            &app,
            post(&format!("/agreements/{}/sign", agreement_id), json!({ "farmer_id": farmer })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, anchoring) = call(
        &app,
        post(
            &format!("/agreements/{}/anchor", agreement_id),
            json!({ "document_cid": "cid123" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(anchoring["status"], "anchoring");

    let settled = node
        .agreements
        .wait_settled(&agreement_id, std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(settled.status.to_string(), "anchored");

    let (_, listing) = call(&app, get("/integration/requests/farmer-b")).await;
    assert_eq!(listing["received"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn document_upload_returns_content_id() {
    let (_dir, node) = fallback_node();
    let app = app(&node);

    let req = Request::post("/documents")
        .header("x-filename", "agreement.pdf")
        .body(Body::from(&b"%PDF-1.4 signed agreement"[..]))
        .unwrap();
    let (status, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["cid"].as_str().unwrap().starts_with("bafkrei"));
    assert_eq!(body["size"], 25);

    let empty = Request::post("/documents").body(Body::empty()).unwrap();
    assert_eq!(call(&app, empty).await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn scanned_documents_over_two_megabytes_upload() {
    let (_dir, node) = fallback_node();
    let app = app(&node);

    let scan = vec![0x25u8; 3 * 1024 * 1024];
    let req = Request::post("/documents")
        .header("x-filename", "agreement-scan.pdf")
        .body(Body::from(scan))
        .unwrap();
    let (status, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["size"], 3 * 1024 * 1024);

    let oversized = Request::post("/documents")
        .body(Body::from(vec![0u8; 11 * 1024 * 1024]))
        .unwrap();
    assert_eq!(call(&app, oversized).await.0, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn metrics_are_exported() {
    let (_dir, node) = fallback_node();
    let app = app(&node);

    let (status, body) = call(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().unwrap().contains("http_requests_total"));

    let (status, body) = call(&app, get("/metrics/json")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["http_requests"].as_u64().is_some());
}

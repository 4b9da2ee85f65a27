// src/api.rs
// Axum router for land matching, integration requests, agreements and document upload

use crate::agreement::{Agreement, AgreementMachine, AgreementStatus, DraftAgreement, Party};
use crate::anchor_service::LedgerAnchoringService;
use crate::documents::{DocumentMetadata, DocumentStore, MAX_DOCUMENT_BYTES};
use crate::error::{CoreError, ErrorClass};
use crate::integration::{Decision, IntegrationLedger, NewRequest};
use crate::land::{NewParcel, ParcelRegistry};
use crate::payload::{AnchorInput, CanonicalPayload};
use crate::simple_metrics::METRICS;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Extension, Path, Query};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Everything the handlers touch. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub parcels: ParcelRegistry,
    pub integration: IntegrationLedger,
    pub agreements: AgreementMachine,
    pub anchoring: LedgerAnchoringService,
    pub documents: Arc<dyn DocumentStore>,
    /// How long `POST /agreements` waits for a terminal anchoring state.
    pub settle_budget: Duration,
}

/// Accepted API keys; empty disables authentication.
#[derive(Clone, Default)]
pub struct ApiKeys(pub Arc<Vec<String>>);

#[derive(Debug, Error)]
enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BadRequest", msg.clone()),
            ApiError::Core(e) => {
                let status = match e.class() {
                    ErrorClass::Validation => StatusCode::BAD_REQUEST,
                    ErrorClass::Authorization => StatusCode::FORBIDDEN,
                    ErrorClass::Conflict => StatusCode::CONFLICT,
                    ErrorClass::NotFound => StatusCode::NOT_FOUND,
                    ErrorClass::Transient => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.code(), e.to_string())
            }
        };
        if status.is_server_error() {
            METRICS.inc_http_errors();
            error!("{}: {}", code, message);
        }
        let body = json!({ "error": code, "message": message });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

///////////////////////////////////////////////////////////////////////////
// Health / metrics / ledger mode
///////////////////////////////////////////////////////////////////////////

async fn health(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "ledger_mode": state.anchoring.get_mode(),
        "uptime_secs": METRICS.uptime_secs(),
    }))
}

async fn get_metrics() -> impl IntoResponse {
    METRICS.export_prometheus()
}

async fn get_metrics_json() -> impl IntoResponse {
    Json(METRICS.export_json())
}

async fn ledger_mode(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(state.anchoring.mode_report())
}

///////////////////////////////////////////////////////////////////////////
// Land
///////////////////////////////////////////////////////////////////////////

async fn register_parcel(
    Extension(state): Extension<AppState>,
    Json(body): Json<NewParcel>,
) -> ApiResult<impl IntoResponse> {
    let parcel = state.parcels.register(body)?;
    Ok((StatusCode::CREATED, Json(parcel)))
}

#[derive(Deserialize)]
struct ReadyBody {
    farmer_id: String,
    ready: bool,
}

async fn set_ready(
    Extension(state): Extension<AppState>,
    Path(parcel_id): Path<String>,
    Json(body): Json<ReadyBody>,
) -> ApiResult<impl IntoResponse> {
    let parcel = state.parcels.set_ready(&body.farmer_id, &parcel_id, body.ready)?;
    Ok(Json(parcel))
}

#[derive(Deserialize)]
struct CandidateQuery {
    farmer_id: String,
    parcel_id: Option<String>,
}

async fn find_candidates(
    Extension(state): Extension<AppState>,
    Query(q): Query<CandidateQuery>,
) -> ApiResult<impl IntoResponse> {
    let candidates = match q.parcel_id.as_deref().filter(|p| !p.is_empty()) {
        Some(parcel_id) => state.integration.find_candidates(&q.farmer_id, parcel_id)?,
        None => state.integration.candidates_for_farmer(&q.farmer_id)?,
    };
    Ok(Json(json!({
        "farmer_id": q.farmer_id,
        "count": candidates.len(),
        "candidates": candidates,
    })))
}

///////////////////////////////////////////////////////////////////////////
// Integration requests
///////////////////////////////////////////////////////////////////////////

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequestBody {
    requester_id: String,
    target_id: String,
    requester_parcel_id: String,
    target_parcel_id: String,
    #[serde(default)]
    integration_period: Option<crate::agreement::IntegrationPeriod>,
}

async fn create_request(
    Extension(state): Extension<AppState>,
    Json(body): Json<CreateRequestBody>,
) -> ApiResult<impl IntoResponse> {
    let request = state.integration.create_request(NewRequest {
        requester_id: body.requester_id,
        target_id: body.target_id,
        requester_parcel_id: body.requester_parcel_id,
        target_parcel_id: body.target_parcel_id,
        integration_period: body.integration_period,
    })?;
    Ok((StatusCode::CREATED, Json(request)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RespondBody {
    request_id: String,
    responder_id: String,
    decision: Decision,
}

async fn respond_request(
    Extension(state): Extension<AppState>,
    Json(body): Json<RespondBody>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .integration
        .respond(&body.request_id, &body.responder_id, body.decision)?;
    Ok(Json(outcome))
}

async fn list_requests(
    Extension(state): Extension<AppState>,
    Path(farmer_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.integration.list_for_farmer(&farmer_id)?))
}

///////////////////////////////////////////////////////////////////////////
// Agreements
///////////////////////////////////////////////////////////////////////////

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAgreementBody {
    agreement_id: String,
    farmer1_name: String,
    farmer2_name: String,
    farmer1_land_size: f64,
    farmer2_land_size: f64,
    document_content_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateAgreementResponse {
    agreement_id: String,
    ledger_reference: Option<String>,
    mode: crate::anchor_service::LedgerMode,
    status: AgreementStatus,
}

/// Register an externally signed agreement, anchor it, and wait for the outcome.
async fn create_agreement(
    Extension(state): Extension<AppState>,
    Json(body): Json<CreateAgreementBody>,
) -> ApiResult<Response> {
    for size in [body.farmer1_land_size, body.farmer2_land_size] {
        if !size.is_finite() || size <= 0.0 {
            return Err(CoreError::InvalidLandSize(size).into());
        }
    }
    if body.document_content_id.trim().is_empty() {
        return Err(CoreError::MissingDocument.into());
    }
    // surfaces IncompleteAgreementData before anything is stored
    CanonicalPayload::build(&AnchorInput {
        agreement_id: &body.agreement_id,
        farmer1_name: &body.farmer1_name,
        farmer2_name: &body.farmer2_name,
        farmer1_land_size: body.farmer1_land_size,
        farmer2_land_size: body.farmer2_land_size,
        document_cid: &body.document_content_id,
    })?;

    // parties here are identified by their slot, not their name; two farmers may share a name
    let party = |slot: &str, name: &str, acres: f64| Party {
        farmer_id: format!("{}:{}", body.agreement_id, slot),
        name: name.to_string(),
        land_size_acres: acres,
        parcel_id: None,
    };
    let agreement = state.agreements.register_signed(
        DraftAgreement {
            id: Some(body.agreement_id.clone()),
            party1: party("farmer1", &body.farmer1_name, body.farmer1_land_size),
            party2: party("farmer2", &body.farmer2_name, body.farmer2_land_size),
            integration_period: None,
            source_request_id: None,
        },
        &body.document_content_id,
    )?;

    if agreement.status == AgreementStatus::FullySigned {
        state
            .agreements
            .begin_anchoring(&agreement.id, &body.document_content_id)
            .await?;
    }

    let settled = state
        .agreements
        .wait_settled(&agreement.id, state.settle_budget)
        .await?;

    match settled.status {
        AgreementStatus::Anchored => {
            let receipt = state.anchoring.receipt(&settled.id)?;
            let mode = receipt
                .as_ref()
                .map(|r| r.mode)
                .or(settled.ledger_mode)
                .unwrap_or_else(|| state.anchoring.get_mode());
            let response = CreateAgreementResponse {
                agreement_id: settled.id.clone(),
                ledger_reference: receipt
                    .map(|r| r.transaction_reference)
                    .or(settled.ledger_reference),
                mode,
                status: settled.status,
            };
            Ok((StatusCode::OK, Json(response)).into_response())
        }
        AgreementStatus::AnchorFailed => Err(CoreError::AnchorFailed {
            agreement_id: settled.id.clone(),
            reason: settled
                .last_error
                .unwrap_or_else(|| "retries exhausted".to_string()),
        }
        .into()),
        status => {
            // still anchoring once the wait budget ran out
            warn!("Agreement {} not settled within budget ({})", settled.id, status);
            let response = CreateAgreementResponse {
                agreement_id: settled.id,
                ledger_reference: None,
                mode: state.anchoring.get_mode(),
                status,
            };
            Ok((StatusCode::ACCEPTED, Json(response)).into_response())
        }
    }
}

async fn get_agreement(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let agreement = state.agreements.get(&id)?;
    let (party1, party2) = agreement.contribution_ratios();
    Ok(Json(json!({
        "agreement": agreement,
        "total_land_acres": agreement.total_land_acres(),
        "contribution_ratios": { "party1": party1, "party2": party2 },
    })))
}

async fn anchoring_status(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let agreement = state.agreements.get(&id)?;
    Ok(Json(status_body(&agreement, &state.anchoring)))
}

fn status_body(agreement: &Agreement, anchoring: &LedgerAnchoringService) -> serde_json::Value {
    let mut body = json!({
        "status": agreement.status,
        "mode": agreement.ledger_mode.unwrap_or_else(|| anchoring.get_mode()),
    });
    if let Some(reference) = &agreement.ledger_reference {
        body["ledgerReference"] = json!(reference);
    }
    if let Some(reason) = &agreement.last_error {
        body["lastError"] = json!(reason);
    }
    body
}

#[derive(Deserialize)]
struct SignBody {
    farmer_id: String,
}

async fn sign_agreement(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SignBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.agreements.record_signature(&id, &body.farmer_id).await?))
}

#[derive(Deserialize)]
struct AnchorBody {
    document_cid: String,
}

async fn begin_anchoring(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AnchorBody>,
) -> ApiResult<impl IntoResponse> {
    let agreement = state.agreements.begin_anchoring(&id, &body.document_cid).await?;
    Ok((StatusCode::ACCEPTED, Json(status_body(&agreement, &state.anchoring))))
}

async fn resubmit(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let agreement = state.agreements.resubmit(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(status_body(&agreement, &state.anchoring))))
}

#[derive(Deserialize)]
struct VerifyQuery {
    document_cid: String,
}

async fn verify_agreement(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Query(q): Query<VerifyQuery>,
) -> ApiResult<impl IntoResponse> {
    let verified = state.anchoring.verify(&id, &q.document_cid)?;
    Ok(Json(json!({ "agreement_id": id, "document_cid": q.document_cid, "verified": verified })))
}

#[derive(Deserialize)]
struct AgreementDocumentBody {
    document_cid: String,
    document_type: String,
}

async fn anchor_agreement_document(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AgreementDocumentBody>,
) -> ApiResult<impl IntoResponse> {
    let anchor = state
        .anchoring
        .commit_document(&id, &body.document_cid, &body.document_type)
        .await?;
    Ok((StatusCode::CREATED, Json(anchor)))
}

async fn list_agreement_documents(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let documents = state.anchoring.documents_for(&id)?;
    Ok(Json(json!({
        "agreement_id": id,
        "count": documents.len(),
        "documents": documents,
    })))
}

///////////////////////////////////////////////////////////////////////////
// Documents
///////////////////////////////////////////////////////////////////////////

async fn upload_document(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let metadata = DocumentMetadata {
        filename: header("x-filename"),
        content_type: header("content-type"),
        agreement_id: header("x-agreement-id"),
    };
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty document body".into()));
    }
    let size = body.len();
    let cid = state.documents.upload(body.to_vec(), metadata).await?;
    Ok((StatusCode::CREATED, Json(json!({ "cid": cid, "size": size }))))
}

///////////////////////////////////////////////////////////////////////////
// Middleware
///////////////////////////////////////////////////////////////////////////

/// API key check: `Authorization: Bearer <key>` or `?api_key=<key>`.
pub async fn auth_middleware<B>(
    Extension(keys): Extension<ApiKeys>,
    req: Request<B>,
    next: Next<B>,
) -> Response {
    if keys.0.is_empty() {
        return next.run(req).await;
    }

    let api_key = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .or_else(|| {
            req.uri().query().and_then(|q| {
                q.split('&')
                    .find(|p| p.starts_with("api_key="))
                    .and_then(|p| p.strip_prefix("api_key="))
            })
        });

    if let Some(key) = api_key {
        let key_bytes = key.as_bytes();
        let is_valid = keys.0.iter().any(|valid| {
            let valid_bytes = valid.as_bytes();
            key_bytes.len() == valid_bytes.len() && bool::from(key_bytes.ct_eq(valid_bytes))
        });
        if is_valid {
            return next.run(req).await;
        }
    }

    warn!("Unauthorized API request to {}", req.uri().path());
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized", "message": "missing or invalid API key" })),
    )
        .into_response()
}

async fn tracing_middleware<B>(req: Request<B>, next: Next<B>) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = std::time::Instant::now();
    METRICS.inc_http_requests();

    let response = next.run(req).await;

    info!(
        "{} {} {} - {:.3}s",
        method,
        path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64()
    );
    response
}

pub fn router(state: AppState, keys: ApiKeys) -> Router {
    if keys.0.is_empty() {
        warn!("API authentication disabled (no API keys configured)");
    }

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(get_metrics))
        .route("/metrics/json", get(get_metrics_json))
        .route("/ledger/mode", get(ledger_mode));

    let protected_routes = Router::new()
        .route("/land/parcels", post(register_parcel))
        .route("/land/parcels/:id/ready", post(set_ready))
        .route("/land/candidates", get(find_candidates))
        .route("/integration/requests", post(create_request))
        .route("/integration/respond", post(respond_request))
        .route("/integration/requests/:farmer_id", get(list_requests))
        .route("/agreements", post(create_agreement))
        .route("/agreements/:id", get(get_agreement))
        .route("/agreements/:id/anchoring", get(anchoring_status))
        .route("/agreements/:id/sign", post(sign_agreement))
        .route("/agreements/:id/anchor", post(begin_anchoring))
        .route("/agreements/:id/resubmit", post(resubmit))
        .route("/agreements/:id/verify", get(verify_agreement))
        .route(
            "/agreements/:id/documents",
            get(list_agreement_documents).post(anchor_agreement_document),
        )
        .route(
            "/documents",
            post(upload_document).layer(DefaultBodyLimit::max(MAX_DOCUMENT_BYTES)),
        )
        .layer(middleware::from_fn(auth_middleware))
        .layer(Extension(keys));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(Extension(state))
        .layer(middleware::from_fn(tracing_middleware))
}

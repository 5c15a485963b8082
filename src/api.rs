//! REST API for the Wishfund Engine
//!
//! Thin transport over [`ContractLifecycle`]. Handlers decode the request,
//! call one lifecycle operation and encode the result; a rejected transition
//! comes back with its taxonomy code and the entity's current status.
//!
//! - POST /api/wishes - Ingest carrier content (raw body)
//! - POST /api/proposals - Create proposal
//! - POST /api/proposals/:id/{approve,reject,publish}
//! - POST /api/tasks/:id/claim, /api/claims/:id/submit, /api/submissions/:id/review
//! - GET  /api/contracts/:id/funding - Derived funding status
//! - POST /api/contracts/:id/{proofs,proofs/fetch,psbt/payout,psbt/fundraise,refund,expire}
//! - POST /api/disputes, /api/disputes/:id/{votes,resolve,appeal}

use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::common::{
    generate_correlation_id, log_api_request, log_api_response, ErrorKind, WishfundError,
};
use crate::dispute::OpenDispute;
use crate::lifecycle::{
    ApprovalTerms, ContractLifecycle, FundraisePsbtRequest, NewProposal, PayoutPsbtRequest,
    RefundRequest, ReviewDecision, WorkSubmission,
};
use crate::types::{MerkleProof, VoteDecision};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ClaimTaskRequest {
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitClaimRequest {
    pub agent_id: String,
    #[serde(flatten)]
    pub work: WorkSubmission,
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub decision: ReviewDecision,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FundingProofRequest {
    pub proof: MerkleProof,
    /// Output paying the escrow
    #[serde(default)]
    pub vout: u32,
    /// Refund address for escrow funding
    #[serde(default)]
    pub payer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FetchProofRequest {
    pub tx_id: String,
    #[serde(default)]
    pub vout: u32,
    #[serde(default)]
    pub payer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub arbitrator: String,
    pub decision: VoteDecision,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct AppealRequest {
    pub arbitrators: Vec<String>,
    pub quorum: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_tasks: Option<Vec<String>>,
}

/// Error wrapper rendering a [`WishfundError`] as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub WishfundError);

impl From<WishfundError> for ApiError {
    fn from(e: WishfundError) -> Self {
        Self(e)
    }
}

/// HTTP status for each taxonomy kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::InvalidState
        | ErrorKind::Incomplete
        | ErrorKind::InsufficientFunds
        | ErrorKind::InvalidEscrowState => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Validation | ErrorKind::InvalidScript | ErrorKind::InvalidProof => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Storage | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let pending_tasks = match &self.0 {
            WishfundError::Incomplete { pending, .. } => Some(pending.clone()),
            _ => None,
        };
        let body = ErrorResponse {
            error: self.0.error_code(),
            kind,
            message: self.0.to_string(),
            current_status: self.0.current_status().map(str::to_string),
            pending_tasks,
        };
        (status_for(kind), Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// =============================================================================
// Application State
// =============================================================================

pub type AppState = Arc<ContractLifecycle>;

// =============================================================================
// Handlers
// =============================================================================

/// GET /api/health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "wishfund",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// POST /api/wishes
async fn handle_ingest(State(service): State<AppState>, body: Bytes) -> ApiResult<impl Serialize> {
    Ok(Json(service.ingest(&body).await?))
}

async fn handle_get_wish(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.get_ingestion(&id).await?))
}

/// POST /api/proposals
async fn handle_create_proposal(
    State(service): State<AppState>,
    Json(req): Json<NewProposal>,
) -> Result<(StatusCode, Json<impl Serialize>), ApiError> {
    let proposal = service.create_proposal(req).await?;
    Ok((StatusCode::CREATED, Json(proposal)))
}

async fn handle_get_proposal(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.get_proposal(&id).await?))
}

async fn handle_proposal_tasks(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.tasks_for_proposal(&id).await?))
}

/// POST /api/proposals/:id/approve
///
/// Idempotent: approving again returns the existing contract.
async fn handle_approve(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(terms): Json<ApprovalTerms>,
) -> ApiResult<impl Serialize> {
    Ok(Json(service.approve_proposal(&id, terms).await?))
}

async fn handle_reject(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.reject_proposal(&id).await?))
}

async fn handle_publish(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.publish_proposal(&id).await?))
}

async fn handle_get_task(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.get_task(&id).await?))
}

/// POST /api/tasks/:id/claim
///
/// 409 when the task is not available.
async fn handle_claim(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ClaimTaskRequest>,
) -> Result<(StatusCode, Json<impl Serialize>), ApiError> {
    let claim = service.claim_task(&id, &req.agent_id).await?;
    Ok((StatusCode::CREATED, Json(claim)))
}

async fn handle_get_claim(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.get_claim(&id).await?))
}

async fn handle_submit(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SubmitClaimRequest>,
) -> ApiResult<impl Serialize> {
    Ok(Json(service.submit_claim(&id, &req.agent_id, req.work).await?))
}

async fn handle_get_submission(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.get_submission(&id).await?))
}

async fn handle_review(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> ApiResult<impl Serialize> {
    Ok(Json(service.review_submission(&id, req.decision, req.notes).await?))
}

async fn handle_get_contract(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.get_contract(&id).await?))
}

async fn handle_get_escrow(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.get_escrow(&id).await?))
}

/// GET /api/contracts/:id/funding
async fn handle_funding_status(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.get_funding_status(&id).await?))
}

async fn handle_refresh_funding(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.refresh_funding(&id).await?))
}

async fn handle_funding_proof(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FundingProofRequest>,
) -> ApiResult<impl Serialize> {
    let proof = service
        .submit_funding_proof(&id, req.proof, req.vout, req.payer.as_deref())
        .await?;
    Ok(Json(proof))
}

/// POST /api/contracts/:id/proofs/fetch
async fn handle_fetch_proof(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FetchProofRequest>,
) -> ApiResult<impl Serialize> {
    let proof = service
        .fetch_funding_proof(&id, &req.tx_id, req.vout, req.payer.as_deref())
        .await?;
    Ok(Json(proof))
}

/// POST /api/contracts/:id/psbt/payout
async fn handle_payout_psbt(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PayoutPsbtRequest>,
) -> ApiResult<impl Serialize> {
    Ok(Json(service.build_payout_psbt(&id, req).await?))
}

async fn handle_fundraise_psbt(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FundraisePsbtRequest>,
) -> ApiResult<impl Serialize> {
    Ok(Json(service.build_fundraise_psbts(&id, req).await?))
}

async fn handle_refund(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RefundRequest>,
) -> ApiResult<impl Serialize> {
    Ok(Json(service.refund_escrow(&id, req).await?))
}

async fn handle_expire_contract(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.expire_contract(&id).await?))
}

async fn handle_open_dispute(
    State(service): State<AppState>,
    Json(req): Json<OpenDispute>,
) -> Result<(StatusCode, Json<impl Serialize>), ApiError> {
    let dispute = service.open_dispute(req).await?;
    Ok((StatusCode::CREATED, Json(dispute)))
}

async fn handle_get_dispute(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.get_dispute(&id).await?))
}

async fn handle_vote(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<VoteRequest>,
) -> ApiResult<impl Serialize> {
    Ok(Json(service.vote_dispute(&id, &req.arbitrator, req.decision, req.weight).await?))
}

async fn handle_resolve(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult<impl Serialize> {
    Ok(Json(service.resolve_dispute(&id).await?))
}

async fn handle_appeal(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AppealRequest>,
) -> ApiResult<impl Serialize> {
    Ok(Json(service.appeal_dispute(&id, req.arbitrators, req.quorum).await?))
}

/// GET /api/monitor/tracked
async fn handle_tracked(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.monitor().tracked().await)
}

// =============================================================================
// Middleware
// =============================================================================

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let correlation_id = generate_correlation_id();
    log_api_request(&method, &path, &correlation_id);

    let started = Instant::now();
    let response = next.run(request).await;
    log_api_response(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed().as_millis() as u64,
        &correlation_id,
    );
    response
}

// =============================================================================
// Router Setup
// =============================================================================

/// Create the API router with all endpoints
pub fn create_router(service: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/wishes", post(handle_ingest))
        .route("/api/wishes/:id", get(handle_get_wish))
        .route("/api/proposals", post(handle_create_proposal))
        .route("/api/proposals/:id", get(handle_get_proposal))
        .route("/api/proposals/:id/tasks", get(handle_proposal_tasks))
        .route("/api/proposals/:id/approve", post(handle_approve))
        .route("/api/proposals/:id/reject", post(handle_reject))
        .route("/api/proposals/:id/publish", post(handle_publish))
        .route("/api/tasks/:id", get(handle_get_task))
        .route("/api/tasks/:id/claim", post(handle_claim))
        .route("/api/claims/:id", get(handle_get_claim))
        .route("/api/claims/:id/submit", post(handle_submit))
        .route("/api/submissions/:id", get(handle_get_submission))
        .route("/api/submissions/:id/review", post(handle_review))
        .route("/api/contracts/:id", get(handle_get_contract))
        .route("/api/contracts/:id/escrow", get(handle_get_escrow))
        .route("/api/contracts/:id/funding", get(handle_funding_status))
        .route("/api/contracts/:id/funding/refresh", post(handle_refresh_funding))
        .route("/api/contracts/:id/proofs", post(handle_funding_proof))
        .route("/api/contracts/:id/proofs/fetch", post(handle_fetch_proof))
        .route("/api/contracts/:id/psbt/payout", post(handle_payout_psbt))
        .route("/api/contracts/:id/psbt/fundraise", post(handle_fundraise_psbt))
        .route("/api/contracts/:id/refund", post(handle_refund))
        .route("/api/contracts/:id/expire", post(handle_expire_contract))
        .route("/api/disputes", post(handle_open_dispute))
        .route("/api/disputes/:id", get(handle_get_dispute))
        .route("/api/disputes/:id/votes", post(handle_vote))
        .route("/api/disputes/:id/resolve", post(handle_resolve))
        .route("/api/disputes/:id/appeal", post(handle_appeal))
        .route("/api/monitor/tracked", get(handle_tracked))
        .layer(middleware::from_fn(log_requests))
        .layer(cors)
        .with_state(service)
}

/// Start the API server
pub async fn start_server(service: AppState, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(service);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "Wishfund API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

// =============================================================================
// Tests
// =============================================================================

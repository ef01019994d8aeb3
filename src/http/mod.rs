//! HTTP surface for the orchestration core.
//!
//! Thin controller: every route passes the access compliance gate and a
//! scope-specific rate limiter, then translates service outcomes into
//! status codes verbatim. No business decisions live here.

pub mod rate_limit;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::access::{ensure_compliant, AccessContextProvider, RequestMeta};
use crate::core::{
    ClaimJobOutcome, CommandCreationOutcome, CompleteJobInput, CompleteJobOutcome,
    CompletionStatus, OrchestratorService, RegisterConnectorOutcome, SafetyAssessment, StoreError,
};
use crate::domain::{CreateCommandInput, RegisterConnectorInput, WorkerKind};

use self::rate_limit::{BucketConfig, MemoryCounterStore, RateLimiter};

type ApiError = (StatusCode, Json<Value>);

/// One limiter per HTTP scope.
pub struct RateLimiters {
    pub commands: RateLimiter,
    pub claim: RateLimiter,
    pub complete: RateLimiter,
    pub connectors: RateLimiter,
}

/// Per-scope window settings (config file shape).
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub commands: BucketConfig,
    #[serde(default = "worker_bucket")]
    pub claim: BucketConfig,
    #[serde(default = "worker_bucket")]
    pub complete: BucketConfig,
    #[serde(default = "connector_bucket")]
    pub connectors: BucketConfig,
}

fn worker_bucket() -> BucketConfig {
    // Worker pollers run hot; give them headroom.
    BucketConfig {
        limit: 600,
        window_seconds: 60,
    }
}

fn connector_bucket() -> BucketConfig {
    BucketConfig {
        limit: 20,
        window_seconds: 60,
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            commands: BucketConfig::default(),
            claim: worker_bucket(),
            complete: worker_bucket(),
            connectors: connector_bucket(),
        }
    }
}

impl RateLimiters {
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        let store = Arc::new(MemoryCounterStore::new());
        Self {
            commands: RateLimiter::new("commands", settings.commands, store.clone()),
            claim: RateLimiter::new("jobs.claim", settings.claim, store.clone()),
            complete: RateLimiter::new("jobs.complete", settings.complete, store.clone()),
            connectors: RateLimiter::new("connectors", settings.connectors, store),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    service: Arc<OrchestratorService>,
    access: Arc<dyn AccessContextProvider>,
    limits: Arc<RateLimiters>,
}

impl AppState {
    pub fn new(
        service: Arc<OrchestratorService>,
        access: Arc<dyn AccessContextProvider>,
        limits: Arc<RateLimiters>,
    ) -> Self {
        Self {
            service,
            access,
            limits,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/commands", post(create_command).get(list_commands))
        .route("/jobs/claim", post(claim_job))
        .route("/jobs/:id/complete", post(complete_job))
        .route("/connectors", post(register_connector))
        .route("/orgs/:org_id/capabilities", get(capabilities))
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "orchestrator listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

fn request_meta(addr: SocketAddr, headers: &HeaderMap) -> RequestMeta {
    let mut meta = RequestMeta::new(addr.ip());
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            meta.headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
        }
    }
    meta
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Access gate + rate limit, shared by every route with side effects.
/// `limit_key` is the limiter's (tenant[, sub-scope]) tuple.
async fn guard(
    state: &AppState,
    addr: SocketAddr,
    headers: &HeaderMap,
    org_id: &str,
    user_id: &str,
    limiter: &RateLimiter,
    limit_key: &[&str],
) -> Result<(), ApiError> {
    let role = header_str(headers, "x-user-role").unwrap_or("member");
    let access = state.access.access_context(org_id, user_id, role).await;
    let meta = request_meta(addr, headers);

    if let Err(e) = ensure_compliant(&access, &meta) {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": e.error_code() })),
        ));
    }

    if limiter.check(limit_key) {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(limiter.error_body().clone()),
        ));
    }

    Ok(())
}

fn store_error(e: StoreError) -> ApiError {
    error!(error = %e, "store failure");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "store_error" })),
    )
}

async fn create_command(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(input): Json<CreateCommandInput>,
) -> Result<impl IntoResponse, ApiError> {
    guard(
        &state,
        addr,
        &headers,
        &input.org_id,
        &input.issued_by,
        &state.limits.commands,
        &[&input.org_id],
    )
    .await?;

    match state.service.create_command(input).await.map_err(store_error)? {
        CommandCreationOutcome::Accepted {
            receipt,
            needs_hitl,
            mitigations,
        } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "command_id": receipt.command_id,
                "job_id": receipt.job_id,
                "session_id": receipt.session_id,
                "status": receipt.status,
                "scheduled_for": receipt.scheduled_for,
                "safety": { "needs_hitl": needs_hitl, "mitigations": mitigations },
            })),
        )),
        CommandCreationOutcome::Rejected {
            reasons,
            mitigations,
        } => Err((
            StatusCode::CONFLICT,
            Json(json!({
                "error": "command_rejected",
                "reasons": reasons,
                "mitigations": mitigations,
            })),
        )),
        CommandCreationOutcome::InvalidPayload { code, message } => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": code, "message": message })),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct ListCommandsQuery {
    org_id: String,
    session_id: String,
    #[serde(default = "default_list_limit")]
    limit: usize,
}

fn default_list_limit() -> usize {
    50
}

async fn list_commands(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ListCommandsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = header_str(&headers, "x-user-id").unwrap_or("anonymous").to_string();
    guard(
        &state,
        addr,
        &headers,
        &query.org_id,
        &user_id,
        &state.limits.commands,
        &[&query.org_id],
    )
    .await?;

    let commands = state
        .service
        .list_session_commands(&query.org_id, &query.session_id, query.limit)
        .await
        .map_err(store_error)?;
    Ok(Json(json!({ "commands": commands })))
}

#[derive(Debug, Deserialize)]
struct ClaimJobRequest {
    org_id: String,
    worker: WorkerKind,
    user_id: String,
    #[serde(default)]
    limit: Option<usize>,
}

async fn claim_job(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(input): Json<ClaimJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    guard(
        &state,
        addr,
        &headers,
        &input.org_id,
        &input.user_id,
        &state.limits.claim,
        &[&input.org_id, input.worker.as_str()],
    )
    .await?;

    let outcome = state
        .service
        .claim_job(crate::core::ClaimJobInput {
            org_id: input.org_id,
            worker: input.worker,
            user_id: input.user_id,
            limit: input.limit,
        })
        .await
        .map_err(store_error)?;

    match outcome {
        ClaimJobOutcome::Claimed { envelope } => {
            Ok(Json(json!({ "envelope": envelope })).into_response())
        }
        ClaimJobOutcome::NothingToClaim => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct CompleteJobRequest {
    status: CompletionStatus,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    assessment: Option<SafetyAssessment>,
    user_id: String,
    /// Org scope for the gate; jobs carry it, but the gate runs first.
    org_id: String,
}

async fn complete_job(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
    Json(input): Json<CompleteJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    guard(
        &state,
        addr,
        &headers,
        &input.org_id,
        &input.user_id,
        &state.limits.complete,
        &[&input.org_id],
    )
    .await?;

    let outcome = state
        .service
        .complete_job(CompleteJobInput {
            job_id,
            status: input.status,
            result: input.result,
            error: input.error,
            assessment: input.assessment,
            user_id: input.user_id,
        })
        .await
        .map_err(store_error)?;

    match outcome {
        CompleteJobOutcome::Completed { status } => Ok(Json(json!({ "status": status }))),
        CompleteJobOutcome::CommandNotFound => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "command_not_found" })),
        )),
        CompleteJobOutcome::JobNotFound => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "job_not_found" })),
        )),
        CompleteJobOutcome::InvalidResult { code, message } => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": code, "message": message })),
        )),
    }
}

async fn register_connector(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(input): Json<RegisterConnectorInput>,
) -> Result<impl IntoResponse, ApiError> {
    guard(
        &state,
        addr,
        &headers,
        &input.org_id,
        &input.created_by,
        &state.limits.connectors,
        &[&input.org_id],
    )
    .await?;

    match state
        .service
        .register_connector(input)
        .await
        .map_err(store_error)?
    {
        RegisterConnectorOutcome::Registered { connector_id } => Ok((
            StatusCode::CREATED,
            Json(json!({ "connector_id": connector_id })),
        )),
        RegisterConnectorOutcome::Invalid { code, message } => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": code, "message": message })),
        )),
    }
}

async fn capabilities(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(org_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = header_str(&headers, "x-user-id").unwrap_or("anonymous").to_string();
    guard(
        &state,
        addr,
        &headers,
        &org_id,
        &user_id,
        &state.limits.commands,
        &[&org_id],
    )
    .await?;

    let caps = state
        .service
        .get_capabilities(&org_id)
        .await
        .map_err(store_error)?;
    Ok(Json(caps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::StaticAccessProvider;
    use crate::core::{standard_pipeline, AuditLog, MemoryStore, SafetySettings};

    #[test]
    fn test_router_builds() {
        let service = Arc::new(OrchestratorService::new(
            Arc::new(MemoryStore::new()),
            standard_pipeline(&SafetySettings::default()),
            Arc::new(AuditLog::disabled()),
        ));
        let state = AppState::new(
            service,
            Arc::new(StaticAccessProvider::open()),
            Arc::new(RateLimiters::from_settings(&RateLimitSettings::default())),
        );
        let _router = router(state);
    }

    #[test]
    fn test_rate_limit_settings_defaults() {
        let settings = RateLimitSettings::default();
        assert_eq!(settings.commands.limit, 60);
        assert_eq!(settings.claim.limit, 600);
        assert_eq!(settings.connectors.limit, 20);
    }
}

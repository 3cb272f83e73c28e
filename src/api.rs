//! HTTP surface: user KYC endpoints, provider webhook and admin endpoints

use crate::error::KycError;
use crate::kyc_record::{KycEvent, KycRecord, KycStatus, PersonalDetails};
use crate::kyc_service::{
    KycHealth, KycService, KycStats, KycSummary, OperatorAlert, StartedVerification,
};
use crate::rate_limit_manager::{EndpointClass, RateLimitManager};
use crate::status_reconciler::{StatusReconciler, SweepOptions, SweepReport};
use crate::webhook_handler::{veriff_webhook_handler, WebhookProcessor};
use axum::{
    extract::{ConnectInfo, FromRef, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<KycService>,
    pub rate_limiter: Arc<RateLimitManager>,
    pub reconciler: Arc<StatusReconciler>,
    pub webhook: Arc<WebhookProcessor>,
    pub admin_token: Arc<str>,
}

impl FromRef<AppState> for Arc<WebhookProcessor> {
    fn from_ref(state: &AppState) -> Self {
        state.webhook.clone()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let user_routes: Router<AppState> = Router::new()
        .route(
            "/api/kyc/users/{user_id}/start_verification",
            post(start_verification),
        )
        .route("/api/kyc/users/{user_id}/status", get(verification_status))
        .route("/api/kyc/users/{user_id}/summary", get(verification_summary))
        .route("/api/kyc/users/{user_id}/events", get(verification_events))
        .route_layer(middleware::from_fn_with_state(state.clone(), kyc_rate_limit));

    let admin_routes: Router<AppState> = Router::new()
        .route("/admin/stats", get(admin_stats))
        .route("/admin/health", get(admin_health))
        .route("/admin/reconcile", post(admin_reconcile))
        .route("/admin/records/{record_id}/override", post(admin_override))
        .route("/admin/alerts", get(admin_alerts))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/kyc/webhook/veriff", post(veriff_webhook_handler))
        .merge(user_routes)
        .merge(admin_routes)
        .layer(cors)
        .with_state(state)
}

/// [`KycError`] rendered as a JSON response
pub struct ApiError(pub KycError);

impl From<KycError> for ApiError {
    fn from(err: KycError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            KycError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, json!({ "error": msg }))
            }
            KycError::AlreadyVerified => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "KYC already verified" }),
            ),
            KycError::VerificationInProgress { session_url } => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "KYC verification already in progress", "session_url": session_url }),
            ),
            KycError::NotFound(msg) => {
                info!("Not found: {}", msg);
                (StatusCode::NOT_FOUND, json!({ "error": "not found" }))
            }
            KycError::Provider(_) => (
                StatusCode::BAD_GATEWAY,
                json!({ "error": "Failed to reach verification provider" }),
            ),
            KycError::InvariantViolation { .. } | KycError::Conflict(_) => (
                StatusCode::CONFLICT,
                json!({ "error": "record state conflict" }),
            ),
            KycError::Store(msg) => {
                error!("Store error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Status view returned to users, without personal details
#[derive(Debug, Serialize)]
pub struct StatusView {
    pub record_id: Uuid,
    pub status: KycStatus,
    pub is_verified: bool,
    pub session_url: Option<String>,
    pub decision: Option<String>,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&KycRecord> for StatusView {
    fn from(record: &KycRecord) -> Self {
        Self {
            record_id: record.id(),
            status: record.status(),
            is_verified: record.is_verified(),
            session_url: record.session_url().map(str::to_string),
            decision: record.decision().map(str::to_string),
            reason: record.reason().map(str::to_string),
            updated_at: record.updated_at(),
            verified_at: record.verified_at(),
            expires_at: record.expires_at(),
        }
    }
}

async fn start_verification(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(details): Json<PersonalDetails>,
) -> ApiResult<(StatusCode, Json<StartedVerification>)> {
    let started = state.service.start_verification(&user_id, details).await?;
    Ok((StatusCode::CREATED, Json(started)))
}

async fn verification_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<StatusView>> {
    let record = state.service.refresh_status(&user_id).await?;
    Ok(Json(StatusView::from(&record)))
}

async fn verification_summary(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<KycSummary>> {
    Ok(Json(state.service.summary(&user_id).await?))
}

async fn verification_events(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<KycEvent>>> {
    Ok(Json(state.service.events(&user_id).await?))
}

#[derive(Deserialize)]
struct StatsQuery {
    #[serde(default = "default_stats_days")]
    days: i64,
}

fn default_stats_days() -> i64 {
    30
}

async fn admin_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<KycStats>> {
    Ok(Json(state.service.stats(query.days).await?))
}

async fn admin_health(State(state): State<AppState>) -> ApiResult<Json<KycHealth>> {
    Ok(Json(state.service.health().await?))
}

#[derive(Deserialize, Default)]
struct ReconcileQuery {
    user_id: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

/// On-demand sweep; ignores the minimum age so freshly touched records are
/// checked too
async fn admin_reconcile(
    State(state): State<AppState>,
    Query(query): Query<ReconcileQuery>,
) -> ApiResult<Json<SweepReport>> {
    let report = state
        .reconciler
        .sweep(SweepOptions {
            user_id: query.user_id,
            dry_run: query.dry_run,
            min_age: Some(Duration::ZERO),
        })
        .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
pub struct OverrideRequest {
    pub status: KycStatus,
    pub actor: String,
    #[serde(default)]
    pub note: String,
}

async fn admin_override(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
    Json(request): Json<OverrideRequest>,
) -> ApiResult<Json<StatusView>> {
    if request.actor.trim().is_empty() {
        return Err(KycError::Validation("actor is required".to_string()).into());
    }
    let record = state
        .service
        .admin_override(record_id, request.status, &request.actor, &request.note)
        .await?;
    Ok(Json(StatusView::from(&record)))
}

async fn admin_alerts(State(state): State<AppState>) -> Json<Vec<OperatorAlert>> {
    Json(state.service.alerts().list())
}

/// Per-client fixed-window limit on user endpoints
async fn kyc_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = RateLimitManager::client_identity(request.headers(), peer);
    let class = EndpointClass::from_path(request.uri().path());

    if !state.rate_limiter.check_class(class, &client) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "Rate limit exceeded. Please try again later." })),
        )
            .into_response();
    }

    next.run(request).await
}

async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());

    if provided != Some(&*state.admin_token) {
        warn!("Admin request rejected: invalid token");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Unauthorized" })))
            .into_response();
    }

    next.run(request).await
}

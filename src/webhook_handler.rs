use crate::error::KycError;
use crate::kyc_service::{ApplyOutcome, DecisionSource, KycService};
use crate::rate_limit_manager::{EndpointClass, RateLimitManager};
use crate::session_client::SessionStatus;
use crate::signature::SignatureValidator;
use axum::{
    extract::{ConnectInfo, State},
    http::{Extensions, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Hex HMAC-SHA256 of the raw body
pub const SIGNATURE_HEADER: &str = "x-veriff-signature";

/// Decision callback sent by the provider
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub verification: Option<WebhookVerification>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookVerification {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub status: SessionStatus,
}

impl WebhookPayload {
    pub fn session_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or_else(|| self.verification.as_ref().and_then(|v| v.id.as_deref()))
            .filter(|id| !id.is_empty())
    }

    pub fn status(&self) -> SessionStatus {
        self.verification
            .as_ref()
            .map(|v| v.status.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied { record_id: Uuid },
    Unchanged { record_id: Uuid },
}

/// Why a webhook was refused. Callers only see the status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookRejection {
    RateLimited,
    InvalidSignature,
    MalformedPayload,
    UnknownSession,
    Inconsistent,
    Internal,
}

impl WebhookRejection {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookRejection::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            WebhookRejection::InvalidSignature | WebhookRejection::MalformedPayload => {
                StatusCode::BAD_REQUEST
            }
            WebhookRejection::UnknownSession => StatusCode::NOT_FOUND,
            WebhookRejection::Inconsistent => StatusCode::CONFLICT,
            WebhookRejection::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookRejection {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "status": "error" }))).into_response()
    }
}

/// Rate limit, authenticate, parse and apply provider callbacks
pub struct WebhookProcessor {
    service: Arc<KycService>,
    rate_limiter: Arc<RateLimitManager>,
    validator: SignatureValidator,
}

impl WebhookProcessor {
    pub fn new(
        service: Arc<KycService>,
        rate_limiter: Arc<RateLimitManager>,
        validator: SignatureValidator,
    ) -> Self {
        if !validator.is_configured() {
            error!("Webhook secret not configured, all webhooks will be rejected");
        }
        Self {
            service,
            rate_limiter,
            validator,
        }
    }

    pub async fn process(
        &self,
        client: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, WebhookRejection> {
        if !self.rate_limiter.check_class(EndpointClass::Webhook, client) {
            return Err(WebhookRejection::RateLimited);
        }

        let signature = signature.unwrap_or_default();
        if !self.validator.verify(body, signature) {
            warn!("Invalid webhook signature from {}", client);
            return Err(WebhookRejection::InvalidSignature);
        }

        let payload: WebhookPayload = serde_json::from_slice(body).map_err(|e| {
            warn!("Malformed webhook payload from {}: {}", client, e);
            WebhookRejection::MalformedPayload
        })?;
        let Some(session_id) = payload.session_id() else {
            warn!("Webhook payload without a session id from {}", client);
            return Err(WebhookRejection::MalformedPayload);
        };

        let record = match self.service.repository().find_by_session(session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!("Webhook for unknown session {}", session_id);
                return Err(WebhookRejection::UnknownSession);
            }
            Err(e) => {
                error!("Failed to look up session {}: {}", session_id, e);
                return Err(WebhookRejection::Internal);
            }
        };

        let status = payload.status();
        match self
            .service
            .apply_decision(record, &status, DecisionSource::Webhook)
            .await
        {
            Ok(ApplyOutcome::Applied(record)) => {
                info!(
                    "Processed webhook for record {}: {:?}",
                    record.id(),
                    status.decision
                );
                Ok(WebhookOutcome::Applied {
                    record_id: record.id(),
                })
            }
            Ok(ApplyOutcome::Unchanged(record)) => Ok(WebhookOutcome::Unchanged {
                record_id: record.id(),
            }),
            Err(KycError::InvariantViolation { .. }) => Err(WebhookRejection::Inconsistent),
            Err(e) => {
                error!("Error processing webhook for session {}: {}", session_id, e);
                Err(WebhookRejection::Internal)
            }
        }
    }
}

/// `POST /api/kyc/webhook/veriff`
pub async fn veriff_webhook_handler(
    State(processor): State<Arc<WebhookProcessor>>,
    extensions: Extensions,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = RateLimitManager::client_identity(&headers, peer);
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match processor.process(&client, &body, signature).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "success" }))).into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

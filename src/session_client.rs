//! Outbound client for the identity-verification provider
//!
//! [`VeriffClient`] talks to a Veriff-style REST API. Every request goes
//! through a `governor` limiter so polling sweeps cannot exceed the provider
//! quota; a 429 with `Retry-After` tightens the limiter until restart.

use crate::error::ProviderError;
use crate::kyc_record::{DecisionDetails, KycRecord};
use crate::signature;
use async_trait::async_trait;
use chrono::Utc;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

type ProviderRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const AUTH_CLIENT_HEADER: &str = "X-AUTH-CLIENT";
const HMAC_SIGNATURE_HEADER: &str = "X-HMAC-SIGNATURE";

/// Remote session created for a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub session_url: Option<String>,
}

/// Decision state of a remote session. `decision` is `None` while the user
/// has not finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub code: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl SessionStatus {
    /// Trimmed decision code; blank codes count as no decision
    pub fn decision_code(&self) -> Option<&str> {
        self.decision
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
    }

    pub fn details(&self) -> DecisionDetails {
        DecisionDetails {
            decision: self.decision_code().map(str::to_string),
            code: self.code.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[async_trait]
pub trait VerificationSessionClient: Send + Sync {
    async fn create_session(&self, record: &KycRecord) -> Result<SessionDescriptor, ProviderError>;

    async fn get_status(&self, session_id: &str) -> Result<SessionStatus, ProviderError>;
}

/// Configuration for the provider client
#[derive(Clone, Debug)]
pub struct VeriffConfig {
    pub base_url: String,
    pub api_key: String,
    /// Signs request bodies when set
    pub api_secret: String,
    /// Where the provider sends the user after the flow
    pub callback_url: String,
    pub timeout: Duration,
    pub requests_per_minute: u32,
    /// Longest a request waits for outbound quota before failing
    pub max_throttle_wait: Duration,
}

impl Default for VeriffConfig {
    fn default() -> Self {
        Self {
            base_url: "https://stationapi.veriff.com".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            callback_url: "http://localhost:3000/kyc/callback".to_string(),
            timeout: Duration::from_secs(30),
            requests_per_minute: 60,
            max_throttle_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    verification: SessionRequestBody<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequestBody<'a> {
    callback: &'a str,
    person: PersonRequest<'a>,
    document: DocumentRequest<'a>,
    vendor_data: String,
    timestamp: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersonRequest<'a> {
    first_name: &'a str,
    last_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id_number: Option<&'a str>,
    date_of_birth: String,
}

#[derive(Serialize)]
struct DocumentRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    number: Option<&'a str>,
    #[serde(rename = "type")]
    doc_type: &'static str,
    country: &'a str,
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    verification: CreatedVerification,
}

#[derive(Deserialize)]
struct CreatedVerification {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct SessionStatusResponse {
    #[serde(default)]
    verification: Option<SessionStatus>,
}

pub struct VeriffClient {
    client: Client,
    config: VeriffConfig,
    limiter: RwLock<Arc<ProviderRateLimiter>>,
}

impl VeriffClient {
    pub fn new(config: VeriffConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            error!("Veriff API credentials not configured");
        }

        let client = Client::builder().timeout(config.timeout).build()?;
        let quota = Quota::per_minute(
            NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN),
        );

        Ok(Self {
            client,
            config,
            limiter: RwLock::new(Arc::new(RateLimiter::direct(quota))),
        })
    }

    pub fn config(&self) -> &VeriffConfig {
        &self.config
    }

    /// Wait for outbound quota, bounded by `max_throttle_wait`
    async fn acquire_permit(&self) -> Result<(), ProviderError> {
        let limiter = self.limiter.read().clone();
        match tokio::time::timeout(self.config.max_throttle_wait, limiter.until_ready()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!("Outbound provider quota exhausted");
                Err(ProviderError::Throttled(self.config.max_throttle_wait))
            }
        }
    }

    /// Replace the limiter after a 429
    fn update_rate_limiter(&self, retry_after_seconds: Option<u64>) {
        let quota = if let Some(seconds) = retry_after_seconds {
            // Waiting N seconds means one request per N seconds
            let requests_per_minute = (60.0 / seconds.max(1) as f64).ceil() as u32;
            Quota::per_minute(NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN))
        } else {
            Quota::per_minute(NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN))
        };

        *self.limiter.write() = Arc::new(RateLimiter::direct(quota));

        warn!(
            "Updated provider rate limiter: {}",
            retry_after_seconds
                .map(|s| format!("{}s", s))
                .unwrap_or("default".to_string())
        );
    }

    /// Turn a non-success response into an error, adapting the limiter on 429
    fn check_status(&self, response: &Response) -> Result<(), ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|s| *s > 0);

        if status == StatusCode::TOO_MANY_REQUESTS {
            self.update_rate_limiter(retry_after);
        }

        Err(ProviderError::Status {
            status: status.as_u16(),
            retry_after,
        })
    }

    fn session_request<'a>(&'a self, record: &'a KycRecord) -> CreateSessionRequest<'a> {
        let details = record.details();
        let document_number = Some(details.document_number.as_str()).filter(|n| !n.is_empty());

        CreateSessionRequest {
            verification: SessionRequestBody {
                callback: &self.config.callback_url,
                person: PersonRequest {
                    first_name: &details.first_name,
                    last_name: &details.last_name,
                    id_number: document_number,
                    date_of_birth: details.date_of_birth.format("%Y-%m-%d").to_string(),
                },
                document: DocumentRequest {
                    number: document_number,
                    doc_type: details.document_type.provider_code(),
                    country: &details.nationality,
                },
                vendor_data: record.id().to_string(),
                timestamp: Utc::now().to_rfc3339(),
            },
        }
    }
}

#[async_trait]
impl VerificationSessionClient for VeriffClient {
    async fn create_session(&self, record: &KycRecord) -> Result<SessionDescriptor, ProviderError> {
        self.acquire_permit().await?;

        let url = format!("{}/v1/sessions", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::to_vec(&self.session_request(record))
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        let mut request = self
            .client
            .post(&url)
            .header(AUTH_CLIENT_HEADER, &self.config.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if !self.config.api_secret.is_empty() {
            request = request.header(
                HMAC_SIGNATURE_HEADER,
                signature::sign(&body, &self.config.api_secret),
            );
        }

        let response = request.body(body).send().await.map_err(|e| {
            error!("Network error creating verification session: {}", e);
            ProviderError::from(e)
        })?;

        if let Err(e) = self.check_status(&response) {
            error!("Failed to create verification session: {}", e);
            return Err(e);
        }
        if response.status() != StatusCode::CREATED {
            warn!(
                "Provider answered session creation with {} instead of 201",
                response.status()
            );
        }

        let created: CreateSessionResponse = response.json().await?;
        info!(
            "Created verification session {} for record {}",
            created.verification.id,
            record.id()
        );

        Ok(SessionDescriptor {
            session_id: created.verification.id,
            session_url: created.verification.url,
        })
    }

    async fn get_status(&self, session_id: &str) -> Result<SessionStatus, ProviderError> {
        self.acquire_permit().await?;

        let url = format!(
            "{}/v1/sessions/{}",
            self.config.base_url.trim_end_matches('/'),
            session_id
        );
        let response = self
            .client
            .get(&url)
            .header(AUTH_CLIENT_HEADER, &self.config.api_key)
            .send()
            .await?;

        self.check_status(&response)?;

        let body: SessionStatusResponse = response.json().await?;
        let status = body.verification.unwrap_or_default();
        debug!(
            "Session {} status: decision={:?}",
            session_id, status.decision
        );
        Ok(status)
    }
}

/// Providers send the decision code as either a number or a string
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

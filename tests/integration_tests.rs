use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use parking_lot::Mutex;
use phantom_kyc::kyc_record::DocumentType;
use phantom_kyc::signature::sign;
use phantom_kyc::{
    router, AppState, InMemoryCounterStore, InMemoryKycStore, KycRecord, KycService, LogNotifier,
    OperatorAlerts, PersonalDetails, ProviderError, RateLimitManager, ReconcilerConfig,
    SignatureValidator, StatusReconciler, VeriffClient, VeriffConfig, VerificationSessionClient,
    WebhookProcessor,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const API_KEY: &str = "test-api-key";
const WEBHOOK_SECRET: &str = "whsec_integration";
const ADMIN_TOKEN: &str = "admin-token";

/// Minimal stand-in for the provider's session API
#[derive(Clone, Default)]
struct FakeProvider {
    decisions: Arc<Mutex<HashMap<String, Value>>>,
    requests: Arc<Mutex<Vec<Value>>>,
    created: Arc<Mutex<u32>>,
}

impl FakeProvider {
    fn decide(&self, session_id: &str, decision: &str, reason: Option<&str>) {
        self.decisions.lock().insert(
            session_id.to_string(),
            json!({ "decision": decision, "code": 9001, "reason": reason }),
        );
    }

    fn last_request(&self) -> Option<Value> {
        self.requests.lock().last().cloned()
    }
}

async fn fake_create_session(
    State(provider): State<FakeProvider>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if headers.get("x-auth-client").and_then(|v| v.to_str().ok()) != Some(API_KEY) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    provider.requests.lock().push(body);
    let id = {
        let mut created = provider.created.lock();
        *created += 1;
        format!("sess-{}", *created)
    };
    (
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "verification": { "id": id, "url": format!("https://magic.example/{id}") }
        })),
    )
        .into_response()
}

async fn fake_session_status(
    State(provider): State<FakeProvider>,
    Path(session_id): Path<String>,
) -> Response {
    match session_id.as_str() {
        "throttled" => (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "30")]).into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            StatusCode::OK.into_response()
        }
        "broken" => (StatusCode::OK, "not json").into_response(),
        _ => {
            let mut verification = provider
                .decisions
                .lock()
                .get(&session_id)
                .cloned()
                .unwrap_or_else(|| json!({ "decision": null }));
            verification["id"] = json!(session_id);
            Json(json!({ "status": "success", "verification": verification })).into_response()
        }
    }
}

async fn spawn_fake_provider() -> (FakeProvider, String) {
    let provider = FakeProvider::default();
    let app = Router::new()
        .route("/v1/sessions", post(fake_create_session))
        .route("/v1/sessions/{session_id}", get(fake_session_status))
        .with_state(provider.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (provider, format!("http://{addr}"))
}

fn veriff_config(base_url: &str) -> VeriffConfig {
    VeriffConfig {
        base_url: base_url.to_string(),
        api_key: API_KEY.to_string(),
        timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

fn details() -> PersonalDetails {
    PersonalDetails {
        first_name: "Neo".to_string(),
        last_name: "Motsumi".to_string(),
        date_of_birth: NaiveDate::from_ymd_opt(1990, 4, 12).unwrap(),
        nationality: "BW".to_string(),
        document_type: DocumentType::DrivingLicense,
        document_number: "DL-778899".to_string(),
        address_line_1: "Plot 123, Main Mall".to_string(),
        address_line_2: String::new(),
        city: "Gaborone".to_string(),
        state_province: "South-East".to_string(),
        postal_code: "0000".to_string(),
        country: "BW".to_string(),
    }
}

#[tokio::test]
async fn test_create_session_sends_provider_payload() {
    let (provider, base_url) = spawn_fake_provider().await;
    let client = VeriffClient::new(veriff_config(&base_url)).unwrap();
    let record = KycRecord::new("user-1", details());

    let session = client.create_session(&record).await.unwrap();
    assert_eq!(session.session_id, "sess-1");
    assert_eq!(session.session_url.as_deref(), Some("https://magic.example/sess-1"));

    let sent = provider.last_request().unwrap();
    let verification = &sent["verification"];
    assert_eq!(verification["person"]["firstName"], "Neo");
    assert_eq!(verification["person"]["dateOfBirth"], "1990-04-12");
    assert_eq!(verification["document"]["type"], "DRIVERS_LICENSE");
    assert_eq!(verification["document"]["country"], "BW");
    assert_eq!(verification["vendorData"], record.id().to_string());
}

#[tokio::test]
async fn test_create_session_with_bad_credentials() {
    let (_provider, base_url) = spawn_fake_provider().await;
    let client = VeriffClient::new(VeriffConfig {
        api_key: "wrong".to_string(),
        ..veriff_config(&base_url)
    })
    .unwrap();

    let err = client
        .create_session(&KycRecord::new("user-1", details()))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ProviderError::Status {
            status: 401,
            retry_after: None
        }
    );
}

#[tokio::test]
async fn test_get_status_reads_decision() {
    let (provider, base_url) = spawn_fake_provider().await;
    let client = VeriffClient::new(veriff_config(&base_url)).unwrap();

    let pending = client.get_status("sess-9").await.unwrap();
    assert!(pending.decision.is_none());

    provider.decide("sess-9", "declined", Some("Document expired"));
    let decided = client.get_status("sess-9").await.unwrap();
    assert_eq!(decided.decision.as_deref(), Some("declined"));
    assert_eq!(decided.code.as_deref(), Some("9001"));
    assert_eq!(decided.reason.as_deref(), Some("Document expired"));
}

#[tokio::test]
async fn test_provider_failures_map_to_errors() {
    let (_provider, base_url) = spawn_fake_provider().await;
    let client = VeriffClient::new(veriff_config(&base_url)).unwrap();

    assert_eq!(client.get_status("slow").await.unwrap_err(), ProviderError::Timeout);
    assert!(matches!(
        client.get_status("broken").await.unwrap_err(),
        ProviderError::Decode(_)
    ));
    assert_eq!(
        client.get_status("throttled").await.unwrap_err(),
        ProviderError::Status {
            status: 429,
            retry_after: Some(30)
        }
    );

    let unreachable = VeriffClient::new(veriff_config("http://127.0.0.1:1")).unwrap();
    assert!(matches!(
        unreachable.get_status("sess-1").await.unwrap_err(),
        ProviderError::Network(_)
    ));
}

#[tokio::test]
async fn test_outbound_quota_throttles_requests() {
    let (_provider, base_url) = spawn_fake_provider().await;
    let client = VeriffClient::new(VeriffConfig {
        requests_per_minute: 1,
        max_throttle_wait: Duration::from_millis(50),
        ..veriff_config(&base_url)
    })
    .unwrap();

    client.get_status("sess-1").await.unwrap();
    assert!(matches!(
        client.get_status("sess-1").await.unwrap_err(),
        ProviderError::Throttled(_)
    ));
}

struct TestApp {
    app: Router,
    provider: FakeProvider,
}

async fn test_app() -> TestApp {
    let (provider, base_url) = spawn_fake_provider().await;
    let client = Arc::new(VeriffClient::new(veriff_config(&base_url)).unwrap());
    let service = Arc::new(KycService::new(
        Arc::new(InMemoryKycStore::new()),
        client,
        Arc::new(LogNotifier),
        Arc::new(OperatorAlerts::default()),
    ));
    let rate_limiter = Arc::new(RateLimitManager::new(
        Arc::new(InMemoryCounterStore::new()),
        Default::default(),
    ));
    let reconciler = Arc::new(StatusReconciler::new(
        service.clone(),
        ReconcilerConfig::default(),
        CancellationToken::new(),
    ));
    let webhook = Arc::new(WebhookProcessor::new(
        service.clone(),
        rate_limiter.clone(),
        SignatureValidator::new(WEBHOOK_SECRET),
    ));

    let app = router(AppState {
        service,
        rate_limiter,
        reconciler,
        webhook,
        admin_token: Arc::from(ADMIN_TOKEN),
    });
    TestApp { app, provider }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn start_request(user_id: &str, details: &PersonalDetails, client_ip: &str) -> Request<Body> {
    Request::post(format!("/api/kyc/users/{user_id}/start_verification"))
        .header("content-type", "application/json")
        .header("x-forwarded-for", client_ip)
        .body(Body::from(serde_json::to_vec(details).unwrap()))
        .unwrap()
}

fn webhook_request(body: Value, signature: Option<String>) -> Request<Body> {
    let bytes = serde_json::to_vec(&body).unwrap();
    let mut builder = Request::post("/api/kyc/webhook/veriff")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("x-veriff-signature", signature);
    }
    builder.body(Body::from(bytes)).unwrap()
}

fn signed_webhook(body: Value) -> Request<Body> {
    let signature = sign(&serde_json::to_vec(&body).unwrap(), WEBHOOK_SECRET);
    webhook_request(body, Some(signature))
}

fn admin_request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("x-admin-token", token);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_verification_flow_through_webhook() {
    let TestApp { app, .. } = test_app().await;

    let (status, body) = send(&app, start_request("user-1", &details(), "203.0.113.5")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "in_progress");
    let session_id = body["session_id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        start_request("user-1", &details(), "203.0.113.5"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["session_url"].is_string());

    let (status, body) = send(
        &app,
        signed_webhook(json!({
            "id": session_id,
            "verification": { "decision": "approved", "code": 9001 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let summary = Request::get("/api/kyc/users/user-1/summary")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, summary).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approved");
    assert_eq!(body["is_verified"], true);

    let events = Request::get("/api/kyc/users/user-1/events")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, events).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_webhook_rejections_are_generic() {
    let TestApp { app, .. } = test_app().await;
    let (_, body) = send(&app, start_request("user-1", &details(), "203.0.113.5")).await;
    let session_id = body["session_id"].as_str().unwrap().to_string();
    let payload = json!({ "id": session_id, "verification": { "decision": "approved" } });

    let (status, body) = send(
        &app,
        webhook_request(payload.clone(), Some("00".repeat(32))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "status": "error" }));

    let (status, body) = send(&app, webhook_request(payload, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "status": "error" }));

    let (status, body) = send(
        &app,
        signed_webhook(json!({ "id": "sess-unknown", "verification": { "decision": "approved" } })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "status": "error" }));

    let status_request = Request::get("/api/kyc/users/user-1/status")
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&app, status_request).await;
    assert_eq!(body["status"], "in_progress");
}

#[tokio::test]
async fn test_start_verification_rate_limited() {
    let TestApp { app, .. } = test_app().await;
    let mut invalid = details();
    invalid.first_name = String::new();

    for _ in 0..5 {
        let (status, _) = send(&app, start_request("user-1", &invalid, "198.51.100.1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
    let (status, _) = send(&app, start_request("user-1", &invalid, "198.51.100.1")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    // Another client is unaffected
    let (status, _) = send(&app, start_request("user-2", &details(), "198.51.100.2")).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_admin_endpoints_require_token() {
    let TestApp { app, .. } = test_app().await;

    let (status, _) = send(&app, admin_request("GET", "/admin/stats", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, admin_request("GET", "/admin/alerts", Some("wrong"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        admin_request("GET", "/admin/stats?days=7", Some(ADMIN_TOKEN)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_records"], 0);
    assert_eq!(body["period_days"], 7);

    let (status, _) = send(
        &app,
        admin_request("GET", "/admin/stats?days=200000000", Some(ADMIN_TOKEN)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, admin_request("GET", "/admin/health", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, body) = send(&app, admin_request("GET", "/admin/health", Some(ADMIN_TOKEN))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["warnings"], json!([]));
}

#[tokio::test]
async fn test_admin_reconcile_applies_missed_decisions() {
    let TestApp { app, provider } = test_app().await;
    let (_, body) = send(&app, start_request("user-1", &details(), "203.0.113.5")).await;
    let session_id = body["session_id"].as_str().unwrap().to_string();

    provider.decide(&session_id, "declined", Some("Face mismatch"));

    let (status, report) = send(
        &app,
        admin_request("POST", "/admin/reconcile?dry_run=true", Some(ADMIN_TOKEN)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["planned"].as_array().unwrap().len(), 1);
    assert_eq!(report["updated"], 0);

    let (status, report) = send(
        &app,
        admin_request("POST", "/admin/reconcile?user_id=user-1", Some(ADMIN_TOKEN)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["examined"], 1);
    assert_eq!(report["updated"], 1);

    let summary = Request::get("/api/kyc/users/user-1/summary")
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&app, summary).await;
    assert_eq!(body["status"], "rejected");

    // A conflicting late webhook is refused and surfaces as an alert
    let (status, _) = send(
        &app,
        signed_webhook(json!({ "id": session_id, "verification": { "decision": "approved" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (_, alerts) = send(&app, admin_request("GET", "/admin/alerts", Some(ADMIN_TOKEN))).await;
    assert_eq!(alerts.as_array().unwrap().len(), 1);
    assert_eq!(alerts[0]["attempted"], "approved");
}

#[tokio::test]
async fn test_health() {
    let TestApp { app, .. } = test_app().await;
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

mod signature_tests;

use crate::error::ProviderError;
use crate::kyc_record::{DocumentType, KycRecord, PersonalDetails};
use crate::kyc_service::{KycService, OperatorAlerts};
use crate::kyc_store::{InMemoryKycStore, KycRepository};
use crate::notifications::{KycNotification, NotificationSink};
use crate::session_client::{SessionDescriptor, SessionStatus, VerificationSessionClient};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) fn sample_details() -> PersonalDetails {
    PersonalDetails {
        first_name: "Neo".to_string(),
        last_name: "Motsumi".to_string(),
        date_of_birth: NaiveDate::from_ymd_opt(1990, 4, 12).unwrap(),
        nationality: "BW".to_string(),
        document_type: DocumentType::IdCard,
        document_number: "123456789".to_string(),
        address_line_1: "Plot 123, Main Mall".to_string(),
        address_line_2: String::new(),
        city: "Gaborone".to_string(),
        state_province: "South-East".to_string(),
        postal_code: "0000".to_string(),
        country: "BW".to_string(),
    }
}

pub(crate) fn status(decision: &str, reason: Option<&str>) -> SessionStatus {
    SessionStatus {
        decision: Some(decision.to_string()),
        code: None,
        reason: reason.map(str::to_string),
    }
}

/// Provider double with scripted session statuses
#[derive(Default)]
pub(crate) struct MockSessionClient {
    statuses: Mutex<HashMap<String, Result<SessionStatus, ProviderError>>>,
    created: AtomicUsize,
    status_calls: AtomicUsize,
    fail_create: AtomicBool,
}

impl MockSessionClient {
    pub fn set_status(&self, session_id: &str, status: Result<SessionStatus, ProviderError>) {
        self.statuses.lock().insert(session_id.to_string(), status);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VerificationSessionClient for MockSessionClient {
    async fn create_session(&self, record: &KycRecord) -> Result<SessionDescriptor, ProviderError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 500,
                retry_after: None,
            });
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = format!("session-{}-{}", record.user_id(), n);
        Ok(SessionDescriptor {
            session_url: Some(format!("https://verify.example/{session_id}")),
            session_id,
        })
    }

    async fn get_status(&self, session_id: &str) -> Result<SessionStatus, ProviderError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| Ok(SessionStatus::default()))
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<KycNotification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<KycNotification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, notification: KycNotification) {
        self.sent.lock().push(notification);
    }
}

pub(crate) struct TestHarness {
    pub store: Arc<InMemoryKycStore>,
    pub client: Arc<MockSessionClient>,
    pub notifier: Arc<RecordingNotifier>,
    pub alerts: Arc<OperatorAlerts>,
    pub service: Arc<KycService>,
}

pub(crate) fn harness() -> TestHarness {
    let store = Arc::new(InMemoryKycStore::new());
    let client = Arc::new(MockSessionClient::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let alerts = Arc::new(OperatorAlerts::default());
    let service = Arc::new(KycService::new(
        store.clone(),
        client.clone(),
        notifier.clone(),
        alerts.clone(),
    ));
    TestHarness {
        store,
        client,
        notifier,
        alerts,
        service,
    }
}

/// Insert an in-progress record for `user_id` whose last update is
/// `age_minutes` in the past
pub(crate) async fn seed_in_progress(
    store: &InMemoryKycStore,
    user_id: &str,
    session_id: &str,
    age_minutes: i64,
) -> KycRecord {
    let mut record = KycRecord::new(user_id, sample_details());
    store.insert(&mut record).await.unwrap();
    record
        .mark_session_created(session_id, Some(format!("https://verify.example/{session_id}")))
        .unwrap();
    record.backdate(chrono::Duration::minutes(age_minutes));
    store.save(&mut record).await.unwrap();
    record
}

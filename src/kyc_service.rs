//! Decision application and the user-facing KYC operations
//!
//! Both update paths, webhooks and the reconciliation job, end in
//! [`KycService::apply_decision`]. It only changes records through the
//! transition methods on [`KycRecord`] and persists them with a conditional
//! save, reloading and re-applying when another writer got there first.

use crate::error::{KycError, Result};
use crate::kyc_record::{
    Decision, KycEvent, KycRecord, KycStatus, PersonalDetails, TransitionOutcome,
    VerificationLevel,
};
use crate::kyc_store::KycRepository;
use crate::notifications::{KycNotification, NotificationSink};
use crate::session_client::{SessionStatus, VerificationSessionClient};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Attempts at a conditional save before giving up
pub const MAX_SAVE_ATTEMPTS: usize = 3;

pub const SESSION_EXPIRED_REASON: &str = "Session expired - no user action within 24 hours";

const DEFAULT_ALERT_CAPACITY: usize = 1000;

const STUCK_IN_PROGRESS_HOURS: i64 = 2;
const PENDING_BACKLOG_THRESHOLD: usize = 100;
/// Approval rate below this over the last day marks the service degraded
const LOW_APPROVAL_RATE: f64 = 50.0;
const MIN_DECISIONS_FOR_RATE: usize = 10;

/// Which path delivered a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Webhook,
    Reconciliation,
    StatusRefresh,
}

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Applied(KycRecord),
    Unchanged(KycRecord),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }

    pub fn record(&self) -> &KycRecord {
        match self {
            ApplyOutcome::Applied(record) | ApplyOutcome::Unchanged(record) => record,
        }
    }

    pub fn into_record(self) -> KycRecord {
        match self {
            ApplyOutcome::Applied(record) | ApplyOutcome::Unchanged(record) => record,
        }
    }
}

/// Invariant violation surfaced to operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub record_id: Uuid,
    pub user_id: String,
    pub from: KycStatus,
    pub attempted: KycStatus,
    pub detail: String,
    pub source: DecisionSource,
    pub raised_at: DateTime<Utc>,
}

/// Bounded in-memory list of operator alerts, oldest dropped first
pub struct OperatorAlerts {
    alerts: Mutex<VecDeque<OperatorAlert>>,
    capacity: usize,
}

impl OperatorAlerts {
    pub fn new(capacity: usize) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn raise(&self, alert: OperatorAlert) {
        let mut alerts = self.alerts.lock();
        if alerts.len() >= self.capacity {
            alerts.pop_front();
        }
        alerts.push_back(alert);
    }

    pub fn list(&self) -> Vec<OperatorAlert> {
        self.alerts.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }
}

impl Default for OperatorAlerts {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_CAPACITY)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedVerification {
    pub record_id: Uuid,
    pub session_id: String,
    pub session_url: Option<String>,
    pub status: KycStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct KycSummary {
    pub user_id: String,
    /// Record status, or `not_started` when the user has no record
    pub status: String,
    pub is_verified: bool,
    pub is_expired: bool,
    pub verification_level: Option<VerificationLevel>,
    pub session_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub can_start_verification: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct KycStats {
    pub total_records: usize,
    pub period_days: i64,
    pub recent_records: usize,
    pub by_status: BTreeMap<KycStatus, usize>,
    /// Percentage of decided records that were approved
    pub approval_rate: f64,
    /// Mean minutes from creation to approval for records verified in the period
    pub avg_processing_time_minutes: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KycHealth {
    pub status: HealthState,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

pub struct KycService {
    repository: Arc<dyn KycRepository>,
    client: Arc<dyn VerificationSessionClient>,
    notifier: Arc<dyn NotificationSink>,
    alerts: Arc<OperatorAlerts>,
}

impl KycService {
    pub fn new(
        repository: Arc<dyn KycRepository>,
        client: Arc<dyn VerificationSessionClient>,
        notifier: Arc<dyn NotificationSink>,
        alerts: Arc<OperatorAlerts>,
    ) -> Self {
        Self {
            repository,
            client,
            notifier,
            alerts,
        }
    }

    pub fn repository(&self) -> &Arc<dyn KycRepository> {
        &self.repository
    }

    pub fn client(&self) -> &Arc<dyn VerificationSessionClient> {
        &self.client
    }

    pub fn alerts(&self) -> &Arc<OperatorAlerts> {
        &self.alerts
    }

    /// Apply a provider decision to `record`.
    ///
    /// A status without a decision leaves the record untouched. Repeats of a
    /// decision already applied are `Unchanged`. Conflicting decisions on a
    /// terminal record raise an operator alert and return
    /// [`KycError::InvariantViolation`].
    pub async fn apply_decision(
        &self,
        record: KycRecord,
        status: &SessionStatus,
        source: DecisionSource,
    ) -> Result<ApplyOutcome> {
        let Some(code) = status.decision_code() else {
            return Ok(ApplyOutcome::Unchanged(record));
        };

        let decision = Decision::from_code(code);
        if let Decision::Unrecognized(code) = &decision {
            warn!(
                "Unrecognized decision {:?} for record {}, requesting resubmission",
                code,
                record.id()
            );
        }

        let record_id = record.id();
        let mut current = record;
        for attempt in 1..=MAX_SAVE_ATTEMPTS {
            let from = current.status();
            match current.apply(&decision, status.details()) {
                Ok(TransitionOutcome::Unchanged) => {
                    debug!(
                        "Decision {} already applied to record {}",
                        decision.as_str(),
                        record_id
                    );
                    return Ok(ApplyOutcome::Unchanged(current));
                }
                Ok(TransitionOutcome::Applied) => {}
                Err(e) => {
                    if let KycError::InvariantViolation {
                        record_id,
                        from,
                        to,
                        detail,
                    } = &e
                    {
                        error!("Invariant violation from {:?}: {}", source, e);
                        self.alerts.raise(OperatorAlert {
                            record_id: *record_id,
                            user_id: current.user_id().to_string(),
                            from: *from,
                            attempted: *to,
                            detail: detail.clone(),
                            source,
                            raised_at: Utc::now(),
                        });
                    }
                    return Err(e);
                }
            }

            match self.repository.save(&mut current).await {
                Ok(()) => {
                    info!(
                        "Record {} moved {} -> {} via {:?} (decision {})",
                        record_id,
                        from,
                        current.status(),
                        source,
                        decision.as_str()
                    );
                    self.notify_transition(&current).await;
                    return Ok(ApplyOutcome::Applied(current));
                }
                Err(KycError::Conflict(_)) if attempt < MAX_SAVE_ATTEMPTS => {
                    debug!(
                        "Conflict saving record {} (attempt {}), reloading",
                        record_id, attempt
                    );
                    current = self.load(record_id).await?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(KycError::Conflict(record_id))
    }

    /// Create or restart the user's record and open a provider session.
    ///
    /// When session creation fails the record stays `pending` without a
    /// session and the provider error is returned.
    pub async fn start_verification(
        &self,
        user_id: &str,
        details: PersonalDetails,
    ) -> Result<StartedVerification> {
        if let Err(e) = details.validate(Utc::now().date_naive()) {
            warn!("Rejected verification start for user {}: {}", user_id, e);
            return Err(e);
        }

        let mut record = match self.repository.find_by_user(user_id).await? {
            Some(existing) => {
                match existing.status() {
                    KycStatus::Approved => return Err(KycError::AlreadyVerified),
                    KycStatus::InProgress => {
                        return Err(KycError::VerificationInProgress {
                            session_url: existing.session_url().map(str::to_string),
                        })
                    }
                    KycStatus::Rejected => {
                        return Err(KycError::Validation(
                            "verification was rejected, contact support to reopen it".to_string(),
                        ))
                    }
                    KycStatus::Pending | KycStatus::ResubmissionRequested => {}
                }
                let mut record = existing;
                record.restart(details)?;
                self.repository.save(&mut record).await?;
                record
            }
            None => {
                let mut record = KycRecord::new(user_id, details);
                self.repository.insert(&mut record).await?;
                record
            }
        };

        let descriptor = match self.client.create_session(&record).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(
                    "Failed to create verification session for record {}: {}",
                    record.id(),
                    e
                );
                return Err(e.into());
            }
        };

        record.mark_session_created(&descriptor.session_id, descriptor.session_url.clone())?;
        self.repository.save(&mut record).await?;
        info!(
            "Created verification session {} for user {}",
            descriptor.session_id, user_id
        );

        Ok(StartedVerification {
            record_id: record.id(),
            session_id: descriptor.session_id,
            session_url: descriptor.session_url,
            status: record.status(),
        })
    }

    /// Current record, refreshed from the provider when a session is open.
    /// Provider failures fall back to the stored record.
    pub async fn refresh_status(&self, user_id: &str) -> Result<KycRecord> {
        let record = self
            .repository
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| KycError::NotFound(format!("KYC record for user {user_id}")))?;

        if !record.is_reconcilable() {
            return Ok(record);
        }
        let Some(session_id) = record.session_id().map(str::to_string) else {
            return Ok(record);
        };

        match self.client.get_status(&session_id).await {
            Ok(status) if status.decision_code().is_some() => Ok(self
                .apply_decision(record, &status, DecisionSource::StatusRefresh)
                .await?
                .into_record()),
            Ok(_) => Ok(record),
            Err(e) => {
                warn!("Failed to refresh session {}: {}", session_id, e);
                Ok(record)
            }
        }
    }

    pub async fn summary(&self, user_id: &str) -> Result<KycSummary> {
        let summary = match self.repository.find_by_user(user_id).await? {
            Some(record) => KycSummary {
                user_id: user_id.to_string(),
                status: record.status().to_string(),
                is_verified: record.is_verified(),
                is_expired: record.is_expired(),
                verification_level: Some(record.verification_level()),
                session_url: record.session_url().map(str::to_string),
                created_at: Some(record.created_at()),
                updated_at: Some(record.updated_at()),
                verified_at: record.verified_at(),
                expires_at: record.expires_at(),
                can_start_verification: matches!(
                    record.status(),
                    KycStatus::Pending | KycStatus::ResubmissionRequested
                ),
            },
            None => KycSummary {
                user_id: user_id.to_string(),
                status: "not_started".to_string(),
                is_verified: false,
                is_expired: false,
                verification_level: None,
                session_url: None,
                created_at: None,
                updated_at: None,
                verified_at: None,
                expires_at: None,
                can_start_verification: true,
            },
        };
        Ok(summary)
    }

    pub async fn events(&self, user_id: &str) -> Result<Vec<KycEvent>> {
        let record = self
            .repository
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| KycError::NotFound(format!("KYC record for user {user_id}")))?;
        Ok(record.history().to_vec())
    }

    /// Force a record into `target`, bypassing the terminal-state rules
    pub async fn admin_override(
        &self,
        record_id: Uuid,
        target: KycStatus,
        actor: &str,
        note: &str,
    ) -> Result<KycRecord> {
        for _ in 0..MAX_SAVE_ATTEMPTS {
            let mut record = self.load(record_id).await?;
            if record.admin_override(target, actor, note)? == TransitionOutcome::Unchanged {
                return Ok(record);
            }
            match self.repository.save(&mut record).await {
                Ok(()) => {
                    self.notify_transition(&record).await;
                    return Ok(record);
                }
                Err(KycError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(KycError::Conflict(record_id))
    }

    /// Reject open sessions that saw no activity for `max_age`
    pub async fn expire_stale_sessions(&self, max_age: ChronoDuration) -> Result<usize> {
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return Ok(0);
        };
        let candidates = self.repository.list_reconcilable(None).await?;
        let mut expired = 0;

        for mut record in candidates {
            if record.decision().is_some() || record.updated_at() > cutoff {
                continue;
            }
            let record_id = record.id();
            if let Err(e) = record.expire_session(SESSION_EXPIRED_REASON) {
                warn!("Cannot expire record {}: {}", record_id, e);
                continue;
            }
            match self.repository.save(&mut record).await {
                Ok(()) => {
                    info!("Expired stale verification session for record {}", record_id);
                    self.notifier
                        .notify(KycNotification::Expired {
                            user_id: record.user_id().to_string(),
                        })
                        .await;
                    expired += 1;
                }
                // Touched since listing, so it is no longer stale
                Err(KycError::Conflict(_)) => {
                    debug!("Record {} changed while expiring, skipping", record_id);
                }
                Err(e) => error!("Failed to save expired record {}: {}", record_id, e),
            }
        }

        if expired > 0 {
            info!("Expired {} stale verification sessions", expired);
        }
        Ok(expired)
    }

    pub async fn stats(&self, days: i64) -> Result<KycStats> {
        let since = ChronoDuration::try_days(days.max(0))
            .and_then(|period| Utc::now().checked_sub_signed(period))
            .ok_or_else(|| KycError::Validation(format!("days out of range: {days}")))?;
        let records = self.repository.list_all().await?;

        let mut by_status: BTreeMap<KycStatus, usize> =
            KycStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for record in &records {
            *by_status.entry(record.status()).or_default() += 1;
        }

        let approved = by_status[&KycStatus::Approved];
        let decided = approved + by_status[&KycStatus::Rejected];
        let approval_rate = if decided > 0 {
            approved as f64 / decided as f64 * 100.0
        } else {
            0.0
        };

        let processing_minutes: Vec<f64> = records
            .iter()
            .filter_map(|r| r.verified_at().map(|verified| (r, verified)))
            .filter(|(_, verified)| *verified >= since)
            .map(|(r, verified)| (verified - r.created_at()).num_seconds() as f64 / 60.0)
            .collect();
        let avg_processing_time_minutes = if processing_minutes.is_empty() {
            0.0
        } else {
            let mean = processing_minutes.iter().sum::<f64>() / processing_minutes.len() as f64;
            (mean * 100.0).round() / 100.0
        };

        Ok(KycStats {
            total_records: records.len(),
            period_days: days,
            recent_records: records.iter().filter(|r| r.created_at() >= since).count(),
            by_status,
            approval_rate,
            avg_processing_time_minutes,
        })
    }

    /// Operational health: stuck sessions, pending backlog and the approval
    /// rate of the last day
    pub async fn health(&self) -> Result<KycHealth> {
        let records = self.repository.list_all().await?;
        let now = Utc::now();
        let mut health = KycHealth {
            status: HealthState::Healthy,
            issues: Vec::new(),
            warnings: Vec::new(),
            checked_at: now,
        };

        let stuck_cutoff = now - ChronoDuration::hours(STUCK_IN_PROGRESS_HOURS);
        let stuck = records
            .iter()
            .filter(|r| r.status() == KycStatus::InProgress && r.updated_at() < stuck_cutoff)
            .count();
        if stuck > 0 {
            health.warnings.push(format!(
                "{stuck} records stuck in progress for >{STUCK_IN_PROGRESS_HOURS} hours"
            ));
        }

        let pending = records
            .iter()
            .filter(|r| r.status() == KycStatus::Pending)
            .count();
        if pending > PENDING_BACKLOG_THRESHOLD {
            health
                .warnings
                .push(format!("High pending volume: {pending} records"));
        }

        let recent_cutoff = now - ChronoDuration::days(1);
        let recent = records.iter().filter(|r| r.created_at() >= recent_cutoff);
        let (approved, rejected) = recent.fold((0usize, 0usize), |(a, r), record| {
            match record.status() {
                KycStatus::Approved => (a + 1, r),
                KycStatus::Rejected => (a, r + 1),
                _ => (a, r),
            }
        });
        let decided = approved + rejected;
        if decided > MIN_DECISIONS_FOR_RATE {
            let rate = approved as f64 / decided as f64 * 100.0;
            if rate < LOW_APPROVAL_RATE {
                health.issues.push(format!("Low approval rate: {rate:.1}%"));
                health.status = HealthState::Degraded;
            }
        }

        if health.status == HealthState::Degraded || !health.warnings.is_empty() {
            warn!(
                "KYC health {:?}: issues={:?} warnings={:?}",
                health.status, health.issues, health.warnings
            );
        }
        Ok(health)
    }

    async fn load(&self, record_id: Uuid) -> Result<KycRecord> {
        self.repository
            .get(record_id)
            .await?
            .ok_or_else(|| KycError::NotFound(format!("KYC record {record_id}")))
    }

    async fn notify_transition(&self, record: &KycRecord) {
        let user_id = record.user_id().to_string();
        let reason = record.reason().map(str::to_string);
        let notification = match record.status() {
            KycStatus::Approved => KycNotification::Approved { user_id },
            KycStatus::Rejected => KycNotification::Rejected { user_id, reason },
            KycStatus::ResubmissionRequested => {
                KycNotification::ResubmissionRequested { user_id, reason }
            }
            KycStatus::Pending | KycStatus::InProgress => return,
        };
        self.notifier.notify(notification).await;
    }
}

//! KYC record entity and its status transitions
//!
//! A record tracks one user's verification lifecycle. Status and the provider
//! decision fields are private: the only way to change them is through the
//! transition methods below, which keep `status`, `veriff_decision` and
//! `veriff_reason` consistent and append to the audit history.

use crate::error::{KycError, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

/// Approved verifications are valid for one year
pub const APPROVAL_VALIDITY_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
    ResubmissionRequested,
}

impl KycStatus {
    pub const ALL: [KycStatus; 5] = [
        KycStatus::Pending,
        KycStatus::InProgress,
        KycStatus::Approved,
        KycStatus::Rejected,
        KycStatus::ResubmissionRequested,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            KycStatus::Pending => "pending",
            KycStatus::InProgress => "in_progress",
            KycStatus::Approved => "approved",
            KycStatus::Rejected => "rejected",
            KycStatus::ResubmissionRequested => "resubmission_requested",
        }
    }

    /// Approved and rejected records only move again through an admin override
    pub fn is_terminal(self) -> bool {
        matches!(self, KycStatus::Approved | KycStatus::Rejected)
    }

    /// Statuses swept by the reconciliation job
    pub fn is_reconcilable(self) -> bool {
        matches!(self, KycStatus::Pending | KycStatus::InProgress)
    }
}

impl fmt::Display for KycStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    #[default]
    Basic,
    Enhanced,
    Premium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Passport,
    IdCard,
    DrivingLicense,
}

impl DocumentType {
    /// Document type code understood by the provider
    pub fn provider_code(self) -> &'static str {
        match self {
            DocumentType::Passport => "PASSPORT",
            DocumentType::IdCard => "ID_CARD",
            DocumentType::DrivingLicense => "DRIVERS_LICENSE",
        }
    }
}

/// Identity details submitted when a user starts verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalDetails {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    /// ISO country code, `BW` when omitted
    #[serde(default = "default_country")]
    pub nationality: String,
    pub document_type: DocumentType,
    pub document_number: String,
    pub address_line_1: String,
    #[serde(default)]
    pub address_line_2: String,
    pub city: String,
    pub state_province: String,
    pub postal_code: String,
    /// ISO country code, `BW` when omitted
    #[serde(default = "default_country")]
    pub country: String,
}

pub const DEFAULT_COUNTRY: &str = "BW";

fn default_country() -> String {
    DEFAULT_COUNTRY.to_string()
}

impl PersonalDetails {
    pub fn validate(&self, today: NaiveDate) -> Result<()> {
        let required = [
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
            ("document_number", &self.document_number),
            ("address_line_1", &self.address_line_1),
            ("city", &self.city),
            ("state_province", &self.state_province),
            ("postal_code", &self.postal_code),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(KycError::Validation(format!("{field} is required")));
            }
        }

        for (field, value) in [("nationality", &self.nationality), ("country", &self.country)] {
            let len = value.trim().len();
            if !(2..=3).contains(&len) || !value.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(KycError::Validation(format!(
                    "{field} must be an ISO country code"
                )));
            }
        }

        if self.date_of_birth >= today {
            return Err(KycError::Validation(
                "date_of_birth must be in the past".to_string(),
            ));
        }

        Ok(())
    }
}

/// Decision metadata reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionDetails {
    pub decision: Option<String>,
    pub code: Option<String>,
    pub reason: Option<String>,
}

/// Provider verdict on a verification session.
///
/// `from_code` is total: every string maps to a variant, and every variant
/// maps to exactly one [`Transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Declined,
    ResubmissionRequested,
    Expired,
    Abandoned,
    /// A code this service does not know yet. Treated as a resubmission request.
    Unrecognized(String),
}

impl Decision {
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "approved" => Decision::Approved,
            "declined" => Decision::Declined,
            "resubmission_requested" => Decision::ResubmissionRequested,
            "expired" => Decision::Expired,
            "abandoned" => Decision::Abandoned,
            _ => Decision::Unrecognized(code.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Decision::Approved => "approved",
            Decision::Declined => "declined",
            Decision::ResubmissionRequested => "resubmission_requested",
            Decision::Expired => "expired",
            Decision::Abandoned => "abandoned",
            Decision::Unrecognized(code) => code,
        }
    }

    pub fn transition(&self) -> Transition {
        match self {
            Decision::Approved => Transition::Approve,
            Decision::Declined => Transition::Reject,
            Decision::ResubmissionRequested
            | Decision::Expired
            | Decision::Abandoned
            | Decision::Unrecognized(_) => Transition::RequestResubmission,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Approve,
    Reject,
    RequestResubmission,
}

impl Transition {
    pub fn target_status(self) -> KycStatus {
        match self {
            Transition::Approve => KycStatus::Approved,
            Transition::Reject => KycStatus::Rejected,
            Transition::RequestResubmission => KycStatus::ResubmissionRequested,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Status or decision metadata changed; the record must be saved
    Applied,
    /// Repeat of a transition that already happened
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycEventType {
    VerificationStarted,
    SessionCreated,
    Approved,
    Rejected,
    ResubmissionRequested,
    Expired,
    OverrideApplied,
}

/// Audit trail entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KycEvent {
    pub event_type: KycEventType,
    pub description: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KycRecord {
    id: Uuid,
    user_id: String,
    #[serde(flatten)]
    details: PersonalDetails,
    veriff_session_id: Option<String>,
    veriff_session_url: Option<String>,
    veriff_decision: Option<String>,
    veriff_code: Option<String>,
    veriff_reason: Option<String>,
    status: KycStatus,
    verification_level: VerificationLevel,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    verified_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    reviewed_by: Option<String>,
    #[serde(default)]
    admin_notes: String,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    history: Vec<KycEvent>,
}

impl KycRecord {
    pub fn new(user_id: impl Into<String>, details: PersonalDetails) -> Self {
        let now = Utc::now();
        let mut record = Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            details,
            veriff_session_id: None,
            veriff_session_url: None,
            veriff_decision: None,
            veriff_code: None,
            veriff_reason: None,
            status: KycStatus::Pending,
            verification_level: VerificationLevel::default(),
            created_at: now,
            updated_at: now,
            verified_at: None,
            expires_at: None,
            reviewed_by: None,
            admin_notes: String::new(),
            version: 0,
            history: Vec::new(),
        };
        record.push_event(
            KycEventType::VerificationStarted,
            "KYC verification started".to_string(),
            serde_json::Value::Null,
            None,
        );
        record
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn details(&self) -> &PersonalDetails {
        &self.details
    }

    pub fn status(&self) -> KycStatus {
        self.status
    }

    pub fn session_id(&self) -> Option<&str> {
        self.veriff_session_id.as_deref()
    }

    pub fn session_url(&self) -> Option<&str> {
        self.veriff_session_url.as_deref()
    }

    pub fn decision(&self) -> Option<&str> {
        self.veriff_decision.as_deref()
    }

    pub fn decision_code(&self) -> Option<&str> {
        self.veriff_code.as_deref()
    }

    pub fn reason(&self) -> Option<&str> {
        self.veriff_reason.as_deref()
    }

    pub fn decision_details(&self) -> DecisionDetails {
        DecisionDetails {
            decision: self.veriff_decision.clone(),
            code: self.veriff_code.clone(),
            reason: self.veriff_reason.clone(),
        }
    }

    pub fn verification_level(&self) -> VerificationLevel {
        self.verification_level
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn verified_at(&self) -> Option<DateTime<Utc>> {
        self.verified_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn reviewed_by(&self) -> Option<&str> {
        self.reviewed_by.as_deref()
    }

    pub fn admin_notes(&self) -> &str {
        &self.admin_notes
    }

    pub fn history(&self) -> &[KycEvent] {
        &self.history
    }

    /// Optimistic-concurrency version, bumped by the store on every save
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn is_verified(&self) -> bool {
        self.status == KycStatus::Approved
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires| Utc::now() > expires)
    }

    /// Only submitted records with a remote session can be polled
    pub fn is_reconcilable(&self) -> bool {
        self.status.is_reconcilable() && self.veriff_session_id.is_some()
    }

    /// Record the remote session and move to `in_progress`
    pub fn mark_session_created(
        &mut self,
        session_id: &str,
        session_url: Option<String>,
    ) -> Result<TransitionOutcome> {
        if self.status != KycStatus::Pending {
            return Err(self.violation(
                KycStatus::InProgress,
                "sessions can only be created for pending records",
            ));
        }

        self.veriff_session_id = Some(session_id.to_string());
        self.veriff_session_url = session_url.clone();
        self.status = KycStatus::InProgress;
        self.push_event(
            KycEventType::SessionCreated,
            format!("Verification session created: {session_id}"),
            serde_json::json!({ "session_id": session_id, "session_url": session_url }),
            None,
        );
        Ok(TransitionOutcome::Applied)
    }

    /// Resubmit new details after the provider asked for it.
    ///
    /// Clears the previous session so the record is not polled until a new
    /// one is created.
    pub fn restart(&mut self, details: PersonalDetails) -> Result<TransitionOutcome> {
        match self.status {
            KycStatus::Pending | KycStatus::ResubmissionRequested => {}
            KycStatus::InProgress => {
                return Err(KycError::VerificationInProgress {
                    session_url: self.veriff_session_url.clone(),
                })
            }
            KycStatus::Approved | KycStatus::Rejected => {
                return Err(self.violation(
                    KycStatus::Pending,
                    "terminal records can only be reopened by an administrator",
                ))
            }
        }

        self.details = details;
        self.veriff_session_id = None;
        self.veriff_session_url = None;
        self.veriff_decision = None;
        self.veriff_code = None;
        self.veriff_reason = None;
        self.status = KycStatus::Pending;
        self.push_event(
            KycEventType::VerificationStarted,
            "KYC verification restarted".to_string(),
            serde_json::Value::Null,
            None,
        );
        Ok(TransitionOutcome::Applied)
    }

    /// Apply the transition a provider decision maps to
    pub fn apply(
        &mut self,
        decision: &Decision,
        details: DecisionDetails,
    ) -> Result<TransitionOutcome> {
        match decision.transition() {
            Transition::Approve => self.approve(details),
            Transition::Reject => {
                let reason = details.reason.clone();
                self.reject(reason, details)
            }
            Transition::RequestResubmission => self.request_resubmission(details),
        }
    }

    pub fn approve(&mut self, details: DecisionDetails) -> Result<TransitionOutcome> {
        match self.status {
            KycStatus::Approved => return Ok(TransitionOutcome::Unchanged),
            KycStatus::Rejected => {
                return Err(self.violation(KycStatus::Approved, "record is already rejected"))
            }
            _ => {}
        }

        let now = Utc::now();
        self.record_decision(details);
        self.status = KycStatus::Approved;
        self.verified_at = Some(now);
        self.expires_at = Some(now + ChronoDuration::days(APPROVAL_VALIDITY_DAYS));
        self.push_event(
            KycEventType::Approved,
            "KYC verification approved".to_string(),
            serde_json::to_value(self.decision_details()).unwrap_or_default(),
            None,
        );
        info!("KYC record {} approved", self.id);
        Ok(TransitionOutcome::Applied)
    }

    /// Reject with `reason`. Repeating the same rejection is a no-op; a
    /// rejection with a different reason is an invariant violation.
    pub fn reject(
        &mut self,
        reason: Option<String>,
        details: DecisionDetails,
    ) -> Result<TransitionOutcome> {
        match self.status {
            KycStatus::Rejected if self.veriff_reason == reason => {
                return Ok(TransitionOutcome::Unchanged)
            }
            KycStatus::Rejected => {
                return Err(self.violation(
                    KycStatus::Rejected,
                    &format!(
                        "already rejected with reason {:?}, refusing {:?}",
                        self.veriff_reason, reason
                    ),
                ))
            }
            KycStatus::Approved => {
                return Err(self.violation(KycStatus::Rejected, "record is already approved"))
            }
            _ => {}
        }

        self.apply_rejection(reason, details, KycEventType::Rejected);
        Ok(TransitionOutcome::Applied)
    }

    /// Default branch for any decision that is neither approved nor declined
    pub fn request_resubmission(&mut self, details: DecisionDetails) -> Result<TransitionOutcome> {
        match self.status {
            KycStatus::ResubmissionRequested if self.decision_details() == details => {
                return Ok(TransitionOutcome::Unchanged)
            }
            status if status.is_terminal() => {
                return Err(self.violation(
                    KycStatus::ResubmissionRequested,
                    "record already reached a final decision",
                ))
            }
            _ => {}
        }

        self.record_decision(details);
        self.status = KycStatus::ResubmissionRequested;
        self.push_event(
            KycEventType::ResubmissionRequested,
            format!(
                "KYC verification requires resubmission: {}",
                self.veriff_reason.as_deref().unwrap_or("no reason given")
            ),
            serde_json::to_value(self.decision_details()).unwrap_or_default(),
            None,
        );
        info!("KYC record {} requires resubmission", self.id);
        Ok(TransitionOutcome::Applied)
    }

    /// Reject a session the user abandoned
    pub fn expire_session(&mut self, reason: &str) -> Result<TransitionOutcome> {
        if !self.status.is_reconcilable() {
            return Err(self.violation(KycStatus::Rejected, "only open sessions can expire"));
        }

        self.apply_rejection(
            Some(reason.to_string()),
            DecisionDetails::default(),
            KycEventType::Expired,
        );
        Ok(TransitionOutcome::Applied)
    }

    /// Move to any status, bypassing the terminal-state rules
    pub fn admin_override(
        &mut self,
        target: KycStatus,
        actor: &str,
        note: &str,
    ) -> Result<TransitionOutcome> {
        if target == self.status {
            return Ok(TransitionOutcome::Unchanged);
        }
        // Without a session nothing could ever move the record on again
        if target == KycStatus::InProgress && self.veriff_session_id.is_none() {
            return Err(KycError::Validation(
                "cannot override to in_progress without a verification session".to_string(),
            ));
        }

        let from = self.status;
        let now = Utc::now();
        self.status = target;
        match target {
            KycStatus::Approved => {
                self.verified_at = Some(now);
                self.expires_at = Some(now + ChronoDuration::days(APPROVAL_VALIDITY_DAYS));
            }
            KycStatus::Pending => {
                self.veriff_session_id = None;
                self.veriff_session_url = None;
                self.veriff_decision = None;
                self.veriff_code = None;
                self.veriff_reason = None;
                self.verified_at = None;
                self.expires_at = None;
            }
            _ => {
                self.verified_at = None;
                self.expires_at = None;
            }
        }
        self.reviewed_by = Some(actor.to_string());
        if !note.is_empty() {
            self.admin_notes = note.to_string();
        }
        self.push_event(
            KycEventType::OverrideApplied,
            format!("Status overridden from {from} to {target}"),
            serde_json::json!({ "from": from, "to": target, "note": note }),
            Some(actor.to_string()),
        );
        warn!(
            "KYC record {} overridden by {}: {} -> {}",
            self.id, actor, from, target
        );
        Ok(TransitionOutcome::Applied)
    }

    fn apply_rejection(
        &mut self,
        reason: Option<String>,
        details: DecisionDetails,
        event_type: KycEventType,
    ) {
        self.record_decision(details);
        self.veriff_reason = reason.clone();
        if let Some(reason) = &reason {
            self.admin_notes = reason.clone();
        }
        self.status = KycStatus::Rejected;
        let description = match event_type {
            KycEventType::Expired => "KYC session expired due to inactivity".to_string(),
            _ => format!(
                "KYC verification rejected: {}",
                reason.as_deref().unwrap_or("no reason given")
            ),
        };
        self.push_event(
            event_type,
            description,
            serde_json::to_value(self.decision_details()).unwrap_or_default(),
            None,
        );
        info!("KYC record {} rejected", self.id);
    }

    fn record_decision(&mut self, details: DecisionDetails) {
        self.veriff_decision = details.decision;
        self.veriff_code = details.code;
        self.veriff_reason = details.reason;
    }

    fn push_event(
        &mut self,
        event_type: KycEventType,
        description: String,
        metadata: serde_json::Value,
        created_by: Option<String>,
    ) {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(KycEvent {
            event_type,
            description,
            metadata,
            created_at: now,
            created_by,
        });
    }

    fn violation(&self, to: KycStatus, detail: &str) -> KycError {
        KycError::InvariantViolation {
            record_id: self.id,
            from: self.status,
            to,
            detail: detail.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: ChronoDuration) {
        self.created_at -= by;
        self.updated_at -= by;
    }
}

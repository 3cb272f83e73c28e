//! Error types shared by the KYC core.

use crate::kyc_record::KycStatus;
use std::time::Duration;
use uuid::Uuid;

/// Failure talking to the identity-verification provider.
///
/// Every variant is recoverable: the reconciliation job skips the record and
/// retries on its next sweep.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("provider returned status {status}")]
    Status {
        status: u16,
        retry_after: Option<u64>,
    },
    #[error("failed to decode provider response: {0}")]
    Decode(String),
    #[error("outbound provider quota exhausted, retry in {0:?}")]
    Throttled(Duration),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

/// KYC error type.
#[derive(Debug, thiserror::Error)]
pub enum KycError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("KYC already verified")]
    AlreadyVerified,
    #[error("KYC verification already in progress")]
    VerificationInProgress { session_url: Option<String> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("illegal transition on record {record_id}: {from} -> {to} ({detail})")]
    InvariantViolation {
        record_id: Uuid,
        from: KycStatus,
        to: KycStatus,
        detail: String,
    },
    #[error("record {0} was modified concurrently")]
    Conflict(Uuid),
    #[error("store: {0}")]
    Store(String),
}

impl KycError {
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, KycError::InvariantViolation { .. })
    }
}

impl From<serde_json::Error> for KycError {
    fn from(err: serde_json::Error) -> Self {
        KycError::Store(err.to_string())
    }
}

impl From<std::io::Error> for KycError {
    fn from(err: std::io::Error) -> Self {
        KycError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KycError>;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

/// User-facing notification for an effective status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KycNotification {
    Approved {
        user_id: String,
    },
    Rejected {
        user_id: String,
        reason: Option<String>,
    },
    ResubmissionRequested {
        user_id: String,
        reason: Option<String>,
    },
    Expired {
        user_id: String,
    },
}

impl KycNotification {
    pub fn user_id(&self) -> &str {
        match self {
            KycNotification::Approved { user_id }
            | KycNotification::Rejected { user_id, .. }
            | KycNotification::ResubmissionRequested { user_id, .. }
            | KycNotification::Expired { user_id } => user_id,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            KycNotification::Approved { .. } => "KYC Verification Approved",
            KycNotification::Rejected { .. } => "KYC Verification Rejected",
            KycNotification::ResubmissionRequested { .. } => "KYC Resubmission Required",
            KycNotification::Expired { .. } => "KYC Session Expired",
        }
    }

    pub fn message(&self) -> String {
        match self {
            KycNotification::Approved { .. } => {
                "Your identity verification is complete. Your account limits have been upgraded."
                    .to_string()
            }
            KycNotification::Rejected { reason, .. } => format!(
                "Your identity verification was not successful. Reason: {}",
                reason.as_deref().unwrap_or("not provided")
            ),
            KycNotification::ResubmissionRequested { reason, .. } => format!(
                "Please resubmit your identity documents. Reason: {}",
                reason.as_deref().unwrap_or("not provided")
            ),
            KycNotification::Expired { .. } => {
                "Your verification session expired. Please start a new verification.".to_string()
            }
        }
    }
}

/// Delivery channel for notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: KycNotification);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, notification: KycNotification) {
        info!(
            user_id = notification.user_id(),
            "📨 {}: {}",
            notification.title(),
            notification.message()
        );
    }
}

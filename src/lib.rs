pub mod api;
pub mod config;
pub mod error;
pub mod kyc_record;
pub mod kyc_service;
pub mod kyc_store;
pub mod notifications;
pub mod rate_limit_manager;
pub mod session_client;
pub mod signature;
pub mod status_reconciler;
pub mod webhook_handler;

#[cfg(test)]
mod tests;

pub use api::{router, AppState};
pub use config::KycConfig;
pub use error::{KycError, ProviderError};
pub use kyc_record::{Decision, KycRecord, KycStatus, PersonalDetails, Transition, TransitionOutcome};
pub use kyc_service::{ApplyOutcome, DecisionSource, KycService, OperatorAlerts};
pub use kyc_store::{InMemoryKycStore, KycRepository};
pub use notifications::{LogNotifier, NotificationSink};
pub use rate_limit_manager::{CounterStore, InMemoryCounterStore, RateLimitManager};
pub use session_client::{VeriffClient, VeriffConfig, VerificationSessionClient};
pub use signature::SignatureValidator;
pub use status_reconciler::{ReconcilerConfig, StatusReconciler, SweepOptions, SweepReport};
pub use webhook_handler::WebhookProcessor;

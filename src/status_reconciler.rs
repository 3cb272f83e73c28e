use crate::error::{KycError, Result};
use crate::kyc_record::{Decision, KycStatus};
use crate::kyc_service::{DecisionSource, KycService};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for the status reconciliation job
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// How often to sweep open sessions
    pub poll_interval: Duration,
    /// Records updated more recently than this are skipped by periodic sweeps
    pub min_age: Duration,
    /// How often to expire abandoned sessions
    pub cleanup_interval: Duration,
    /// Inactivity after which an open session is expired
    pub session_expiry: Duration,
    /// Upper bound on a single provider query
    pub per_record_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            min_age: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(86400),
            session_expiry: Duration::from_secs(24 * 3600),
            per_record_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SweepOptions {
    pub user_id: Option<String>,
    pub dry_run: bool,
    /// Overrides the configured minimum age
    pub min_age: Option<Duration>,
}

/// Change a dry-run sweep would have made
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedChange {
    pub record_id: Uuid,
    pub user_id: String,
    pub from: KycStatus,
    pub to: KycStatus,
    pub decision: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// Records whose remote decision conflicted with their terminal state
    pub violations: usize,
    pub planned: Vec<PlannedChange>,
    pub dry_run: bool,
}

/// Polls the provider for records whose webhook may have been missed
pub struct StatusReconciler {
    service: Arc<KycService>,
    config: ReconcilerConfig,
    cancellation_token: CancellationToken,
}

impl StatusReconciler {
    pub fn new(
        service: Arc<KycService>,
        config: ReconcilerConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            service,
            config,
            cancellation_token,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Query the provider for every open session and apply new decisions.
    ///
    /// Per-record failures are counted and logged, never propagated. Stops
    /// between records when cancelled.
    pub async fn sweep(&self, options: SweepOptions) -> Result<SweepReport> {
        let min_age = options.min_age.unwrap_or(self.config.min_age);
        // A min age beyond the calendar range leaves nothing old enough
        let cutoff = ChronoDuration::from_std(min_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let candidates = self
            .service
            .repository()
            .list_reconcilable(options.user_id.as_deref())
            .await?;

        let mut report = SweepReport {
            dry_run: options.dry_run,
            ..Default::default()
        };

        for record in candidates {
            if self.cancellation_token.is_cancelled() {
                info!("Reconciliation sweep cancelled after {} records", report.examined);
                break;
            }
            if record.updated_at() > cutoff {
                continue;
            }
            let Some(session_id) = record.session_id().map(str::to_string) else {
                continue;
            };
            report.examined += 1;

            let status = match tokio::time::timeout(
                self.config.per_record_timeout,
                self.service.client().get_status(&session_id),
            )
            .await
            {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    error!("Failed to check status for session {}: {}", session_id, e);
                    report.failed += 1;
                    continue;
                }
                Err(_) => {
                    error!("Timed out checking status for session {}", session_id);
                    report.failed += 1;
                    continue;
                }
            };

            let Some(decision) = status.decision_code().map(str::to_string) else {
                report.unchanged += 1;
                continue;
            };
            if record.decision() == Some(decision.as_str()) {
                report.unchanged += 1;
                continue;
            }

            if options.dry_run {
                let mut preview = record.clone();
                match preview.apply(&Decision::from_code(&decision), status.details()) {
                    Ok(_) if preview.status() != record.status() => {
                        report.planned.push(PlannedChange {
                            record_id: record.id(),
                            user_id: record.user_id().to_string(),
                            from: record.status(),
                            to: preview.status(),
                            decision,
                        });
                    }
                    Ok(_) => report.unchanged += 1,
                    Err(e) => {
                        warn!("Dry run: record {} would violate: {}", record.id(), e);
                        report.violations += 1;
                    }
                }
                continue;
            }

            let record_id = record.id();
            match self
                .service
                .apply_decision(record, &status, DecisionSource::Reconciliation)
                .await
            {
                Ok(outcome) if outcome.is_applied() => report.updated += 1,
                Ok(_) => report.unchanged += 1,
                Err(e @ KycError::InvariantViolation { .. }) => {
                    debug!("Violation on record {} recorded: {}", record_id, e);
                    report.violations += 1;
                }
                Err(e) => {
                    error!("Failed to apply decision to record {}: {}", record_id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "KYC status check complete: examined={}, updated={}, unchanged={}, failed={}, violations={}{}",
            report.examined,
            report.updated,
            report.unchanged,
            report.failed,
            report.violations,
            if report.dry_run { " (dry run)" } else { "" }
        );
        Ok(report)
    }

    /// Expire abandoned sessions once
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let max_age = ChronoDuration::from_std(self.config.session_expiry)
            .unwrap_or_else(|_| ChronoDuration::hours(24));
        self.service.expire_stale_sessions(max_age).await
    }

    /// Run periodic sweeps and cleanups until cancelled
    pub async fn run(&self) {
        info!(
            "🚀 Starting KYC status reconciler (poll every {:?}, cleanup every {:?})",
            self.config.poll_interval, self.config.cleanup_interval
        );

        let mut poll_interval = interval(self.config.poll_interval);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_interval = interval(self.config.cleanup_interval);
        cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("KYC status reconciler cancelled");
                    break;
                }

                _ = poll_interval.tick() => {
                    if let Err(e) = self.sweep(SweepOptions::default()).await {
                        error!("KYC status sweep failed: {}", e);
                    }
                }

                _ = cleanup_interval.tick() => {
                    if let Err(e) = self.cleanup_expired().await {
                        error!("Expired session cleanup failed: {}", e);
                    }
                }
            }
        }
    }
}

use crate::rate_limit_manager::{RateLimitConfig, RateLimitPolicy};
use crate::session_client::VeriffConfig;
use crate::status_reconciler::ReconcilerConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_ADMIN_TOKEN: &str = "default-admin-token";

/// Service configuration, read once at startup
#[derive(Clone, Debug)]
pub struct KycConfig {
    pub bind_addr: String,
    pub veriff: VeriffConfig,
    pub webhook_secret: String,
    pub reconciler: ReconcilerConfig,
    pub rate_limits: RateLimitConfig,
    pub state_file: PathBuf,
    pub snapshot_interval: Duration,
    pub admin_token: String,
}

impl Default for KycConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            veriff: VeriffConfig::default(),
            webhook_secret: String::new(),
            reconciler: ReconcilerConfig::default(),
            rate_limits: RateLimitConfig::default(),
            state_file: PathBuf::from("./data/kyc_state.json"),
            snapshot_interval: Duration::from_secs(30),
            admin_token: DEFAULT_ADMIN_TOKEN.to_string(),
        }
    }
}

impl KycConfig {
    /// Build from environment variables, falling back to defaults for
    /// anything unset or unparsable
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let veriff = VeriffConfig {
            base_url: env_string("VERIFF_BASE_URL", &defaults.veriff.base_url),
            api_key: env_string("VERIFF_API_KEY", ""),
            api_secret: env_string("VERIFF_API_SECRET", ""),
            callback_url: env_string("VERIFF_CALLBACK_URL", &defaults.veriff.callback_url),
            timeout: Duration::from_secs(env_parse("VERIFF_TIMEOUT_SECS", 30)),
            requests_per_minute: env_parse("PROVIDER_REQUESTS_PER_MINUTE", 60),
            ..defaults.veriff
        };

        let reconciler = ReconcilerConfig {
            poll_interval: Duration::from_secs(env_parse("KYC_POLL_INTERVAL_SECS", 300)),
            min_age: Duration::from_secs(env_parse("KYC_POLL_MIN_AGE_SECS", 300)),
            cleanup_interval: Duration::from_secs(env_parse("KYC_CLEANUP_INTERVAL_SECS", 86400)),
            session_expiry: Duration::from_secs(env_parse::<u64>("KYC_SESSION_EXPIRY_HOURS", 24).saturating_mul(3600)),
            ..defaults.reconciler
        };

        let rate_limits = RateLimitConfig {
            verification_start: RateLimitPolicy::new(env_parse("RATE_LIMIT_START_PER_HOUR", 5), 3600),
            webhook: RateLimitPolicy::new(env_parse("RATE_LIMIT_WEBHOOK_PER_MINUTE", 100), 60),
            general: RateLimitPolicy::new(env_parse("RATE_LIMIT_GENERAL_PER_5MIN", 60), 300),
        };

        let admin_token = std::env::var("ADMIN_TOKEN").unwrap_or_else(|_| {
            warn!("ADMIN_TOKEN not set, using default");
            DEFAULT_ADMIN_TOKEN.to_string()
        });

        Self {
            bind_addr: env_string("BIND_ADDR", &defaults.bind_addr),
            veriff,
            webhook_secret: env_string("VERIFF_WEBHOOK_SECRET", ""),
            reconciler,
            rate_limits,
            state_file: PathBuf::from(env_string("STATE_FILE", "./data/kyc_state.json")),
            snapshot_interval: defaults.snapshot_interval,
            admin_token,
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

use axum::http::HeaderMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counter storage with per-key expiry
pub trait CounterStore: Send + Sync {
    /// Current count for `key`, zero when absent or expired
    fn get(&self, key: &str) -> u32;

    /// Increment `key` if its count is below `limit`, starting a new window of
    /// length `window` when the key is absent or expired. Returns the new
    /// count, or `None` when the limit is already reached. Check and increment
    /// happen atomically.
    fn increment_with_expiry(&self, key: &str, limit: u32, window: Duration) -> Option<u32>;
}

struct CounterEntry {
    count: u32,
    expires_at: Instant,
}

/// Process-local counter store. Counters are lost on restart.
#[derive(Default)]
pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<String, CounterEntry>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired counters, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Periodically purge expired counters until cancelled
    pub async fn run_cleanup(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Rate limit counter cleanup stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = self.purge_expired();
                    if removed > 0 {
                        debug!(removed, remaining = self.len(), "Purged expired rate limit counters");
                    }
                }
            }
        }
    }
}

impl CounterStore for InMemoryCounterStore {
    fn get(&self, key: &str) -> u32 {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    fn increment_with_expiry(&self, key: &str, limit: u32, window: Duration) -> Option<u32> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                if entry.count >= limit {
                    return None;
                }
                entry.count += 1;
                Some(entry.count)
            }
            _ => {
                if limit == 0 {
                    return None;
                }
                let Some(expires_at) = now.checked_add(window) else {
                    warn!(key, ?window, "Rate limit window out of range, denying");
                    return None;
                };
                entries.insert(
                    key.to_string(),
                    CounterEntry {
                        count: 1,
                        expires_at,
                    },
                );
                Some(1)
            }
        }
    }
}

/// Groups of endpoints sharing a limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    VerificationStart,
    Webhook,
    General,
}

impl EndpointClass {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointClass::VerificationStart => "kyc_start",
            EndpointClass::Webhook => "webhook",
            EndpointClass::General => "kyc_general",
        }
    }

    pub fn from_path(path: &str) -> Self {
        if path.contains("/webhook") {
            EndpointClass::Webhook
        } else if path.ends_with("/start_verification") {
            EndpointClass::VerificationStart
        } else {
            EndpointClass::General
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(window_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub verification_start: RateLimitPolicy,
    pub webhook: RateLimitPolicy,
    pub general: RateLimitPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            // 5 verification attempts per hour
            verification_start: RateLimitPolicy::new(5, 3600),
            // 100 webhooks per minute
            webhook: RateLimitPolicy::new(100, 60),
            // 60 requests per 5 minutes
            general: RateLimitPolicy::new(60, 300),
        }
    }
}

impl RateLimitConfig {
    pub fn policy(&self, class: EndpointClass) -> RateLimitPolicy {
        match class {
            EndpointClass::VerificationStart => self.verification_start,
            EndpointClass::Webhook => self.webhook,
            EndpointClass::General => self.general,
        }
    }
}

/// Fixed-window limiter keyed by client identity and endpoint class
pub struct RateLimitManager {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimitManager {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Returns true and counts the request when `key` is under `limit` in the
    /// current window, false without counting otherwise
    pub fn check(&self, key: &str, limit: u32, window_secs: u64) -> bool {
        self.store
            .increment_with_expiry(key, limit, Duration::from_secs(window_secs))
            .is_some()
    }

    pub fn check_class(&self, class: EndpointClass, client: &str) -> bool {
        let policy = self.config.policy(class);
        let key = format!("{}:{}", class.as_str(), client);
        let allowed = self
            .store
            .increment_with_expiry(&key, policy.limit, policy.window)
            .is_some();
        if !allowed {
            info!("Rate limit exceeded for {}", key);
        }
        allowed
    }

    /// Requests counted so far in the current window
    pub fn current_count(&self, class: EndpointClass, client: &str) -> u32 {
        self.store.get(&format!("{}:{}", class.as_str(), client))
    }

    /// First `X-Forwarded-For` entry, else the peer address
    pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

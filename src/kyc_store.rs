use crate::error::{KycError, Result};
use crate::kyc_record::KycRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Persistence seam for KYC records.
///
/// `save` is conditional: it only succeeds when the stored version matches the
/// version the caller loaded, and bumps the version on success. Records are
/// never deleted.
#[async_trait]
pub trait KycRepository: Send + Sync {
    async fn insert(&self, record: &mut KycRecord) -> Result<()>;

    /// Returns [`KycError::Conflict`] when the record changed since it was read
    async fn save(&self, record: &mut KycRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<KycRecord>>;

    async fn find_by_user(&self, user_id: &str) -> Result<Option<KycRecord>>;

    async fn find_by_session(&self, session_id: &str) -> Result<Option<KycRecord>>;

    /// Pending or in-progress records that already have a remote session
    async fn list_reconcilable(&self, user_id: Option<&str>) -> Result<Vec<KycRecord>>;

    async fn list_all(&self) -> Result<Vec<KycRecord>>;
}

/// On-disk snapshot format
#[derive(Debug, Serialize, Deserialize)]
pub struct KycSnapshot {
    pub records: Vec<KycRecord>,
    pub last_saved: DateTime<Utc>,
}

/// In-memory repository with JSON snapshot persistence
#[derive(Default)]
pub struct InMemoryKycStore {
    records: RwLock<HashMap<Uuid, KycRecord>>,
}

impl InMemoryKycStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = KycRecord>) -> Self {
        let records = records.into_iter().map(|r| (r.id(), r)).collect();
        Self {
            records: RwLock::new(records),
        }
    }

    /// Load a snapshot, starting empty when none exists yet
    pub fn load_snapshot(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(json) => {
                let snapshot: KycSnapshot = serde_json::from_str(&json)?;
                info!(
                    "Loaded {} KYC records from {} (saved {})",
                    snapshot.records.len(),
                    path.display(),
                    snapshot.last_saved
                );
                Ok(Self::from_records(snapshot.records))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No previous KYC state found, starting fresh");
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let records = self.records.read().await;
            KycSnapshot {
                records: records.values().cloned().collect(),
                last_saved: Utc::now(),
            }
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so a crash never leaves a truncated snapshot
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Saved {} KYC records to {}", snapshot.records.len(), path.display());
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl KycRepository for InMemoryKycStore {
    async fn insert(&self, record: &mut KycRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.values().any(|r| r.user_id() == record.user_id()) {
            return Err(KycError::Validation(format!(
                "user {} already has a KYC record",
                record.user_id()
            )));
        }
        record.set_version(1);
        records.insert(record.id(), record.clone());
        Ok(())
    }

    async fn save(&self, record: &mut KycRecord) -> Result<()> {
        let mut records = self.records.write().await;
        let stored = records
            .get(&record.id())
            .ok_or_else(|| KycError::NotFound(format!("KYC record {}", record.id())))?;
        if stored.version() != record.version() {
            return Err(KycError::Conflict(record.id()));
        }
        record.set_version(record.version() + 1);
        records.insert(record.id(), record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<KycRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn find_by_user(&self, user_id: &str) -> Result<Option<KycRecord>> {
        let records = self.records.read().await;
        Ok(records.values().find(|r| r.user_id() == user_id).cloned())
    }

    async fn find_by_session(&self, session_id: &str) -> Result<Option<KycRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .find(|r| r.session_id() == Some(session_id))
            .cloned())
    }

    async fn list_reconcilable(&self, user_id: Option<&str>) -> Result<Vec<KycRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<KycRecord> = records
            .values()
            .filter(|r| r.is_reconcilable())
            .filter(|r| user_id.is_none_or(|u| r.user_id() == u))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.updated_at());
        Ok(matching)
    }

    async fn list_all(&self) -> Result<Vec<KycRecord>> {
        let records = self.records.read().await;
        let mut all: Vec<KycRecord> = records.values().cloned().collect();
        all.sort_by_key(|r| r.created_at());
        Ok(all)
    }
}

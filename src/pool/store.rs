//! Registry storage
//!
//! The store owns atomicity: `modify` applies a transition under the store's
//! lock so two callers can never interleave a read-modify-write on the same
//! record. Leases give the heartbeat monitor cross-instance exclusion.

use super::service::InferenceService;
use crate::{ParleyError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub type Transition = Box<dyn FnOnce(&mut InferenceService) -> Result<()> + Send>;

#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn get(&self, service_id: &str) -> Result<Option<InferenceService>>;

    async fn list(&self) -> Result<Vec<InferenceService>>;

    async fn upsert(&self, service: InferenceService) -> Result<()>;

    /// Returns false if nothing was removed
    async fn remove(&self, service_id: &str) -> Result<bool>;

    /// Apply `transition` atomically. A failed transition leaves the record
    /// untouched.
    async fn modify(&self, service_id: &str, transition: Transition) -> Result<InferenceService>;

    /// Set-if-absent with expiry
    async fn try_acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Drop the lease if `owner` still holds it
    async fn release_lease(&self, key: &str, owner: &str) -> Result<()>;
}

struct Lease {
    owner: String,
    expires_at: Instant,
}

/// In-process store, optionally snapshotted to a JSON file after each write
#[derive(Default)]
pub struct MemoryStore {
    services: Mutex<HashMap<String, InferenceService>>,
    leases: Mutex<HashMap<String, Lease>>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the snapshot at `path` if it exists and keep writing to it
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut services = HashMap::new();

        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let records: Vec<InferenceService> = serde_json::from_str(&text)?;
            info!("Loaded {} services from {}", records.len(), path.display());
            for record in records {
                services.insert(record.service_id.clone(), record);
            }
        }

        Ok(Self {
            services: Mutex::new(services),
            leases: Mutex::new(HashMap::new()),
            snapshot_path: Some(path),
        })
    }

    fn persist(&self, services: &HashMap<String, InferenceService>) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let mut records: Vec<&InferenceService> = services.values().collect();
        records.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        match serde_json::to_string_pretty(&records) {
            Ok(text) => {
                let tmp = path.with_extension("tmp");
                if let Err(e) = std::fs::write(&tmp, text).and_then(|_| std::fs::rename(&tmp, path)) {
                    warn!("Failed to write registry snapshot {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("Failed to encode registry snapshot: {}", e),
        }
    }
}

#[async_trait]
impl ServiceStore for MemoryStore {
    async fn get(&self, service_id: &str) -> Result<Option<InferenceService>> {
        Ok(self.services.lock().get(service_id).cloned())
    }

    async fn list(&self) -> Result<Vec<InferenceService>> {
        let mut all: Vec<InferenceService> = self.services.lock().values().cloned().collect();
        all.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        Ok(all)
    }

    async fn upsert(&self, service: InferenceService) -> Result<()> {
        let mut services = self.services.lock();
        services.insert(service.service_id.clone(), service);
        self.persist(&services);
        Ok(())
    }

    async fn remove(&self, service_id: &str) -> Result<bool> {
        let mut services = self.services.lock();
        let removed = services.remove(service_id).is_some();
        if removed {
            self.persist(&services);
        }
        Ok(removed)
    }

    async fn modify(&self, service_id: &str, transition: Transition) -> Result<InferenceService> {
        let mut services = self.services.lock();
        let current = services
            .get(service_id)
            .ok_or_else(|| ParleyError::ServiceNotFound(service_id.to_string()))?;

        let mut next = current.clone();
        transition(&mut next)?;
        services.insert(service_id.to_string(), next.clone());
        self.persist(&services);
        Ok(next)
    }

    async fn try_acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock();
        let now = Instant::now();
        if let Some(lease) = leases.get(key) {
            if lease.expires_at > now {
                debug!("Lease {} held by {}", key, lease.owner);
                return Ok(false);
            }
        }
        leases.insert(
            key.to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<()> {
        let mut leases = self.leases.lock();
        if leases.get(key).map(|l| l.owner == owner).unwrap_or(false) {
            leases.remove(key);
        }
        Ok(())
    }
}

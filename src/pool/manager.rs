use super::service::{InferenceService, ServiceQuery, ServiceRegistration, ServiceStatus};
use super::store::ServiceStore;
use crate::config::InferenceServiceConfig;
use crate::{ParleyError, Result};
use chrono::{Duration, Utc};
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{info, warn};

/// Registration, selection and locking of inference backends
#[derive(Clone)]
pub struct ServiceManager {
    store: Arc<dyn ServiceStore>,
    heartbeat_timeout: Duration,
    lock_timeout: Duration,
}

impl ServiceManager {
    pub fn new(store: Arc<dyn ServiceStore>, config: &InferenceServiceConfig) -> Self {
        Self {
            store,
            heartbeat_timeout: Duration::seconds(config.heartbeat_timeout),
            lock_timeout: Duration::seconds(config.lock_timeout),
        }
    }

    pub fn with_timeouts(mut self, heartbeat_timeout: Duration, lock_timeout: Duration) -> Self {
        self.heartbeat_timeout = heartbeat_timeout;
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn ServiceStore> {
        &self.store
    }

    /// Upsert as AVAILABLE with a fresh heartbeat
    pub async fn register(&self, registration: ServiceRegistration) -> Result<String> {
        let service = InferenceService::from_registration(registration, Utc::now());
        let id = service.service_id.clone();
        self.store.upsert(service).await?;
        info!(service_id = %id, "Service registered");
        Ok(id)
    }

    pub async fn unregister(&self, service_id: &str) -> Result<bool> {
        let removed = self.store.remove(service_id).await?;
        if removed {
            info!(service_id, "Service unregistered");
        }
        Ok(removed)
    }

    pub async fn get(&self, service_id: &str) -> Result<Option<InferenceService>> {
        self.store.get(service_id).await
    }

    pub async fn all(&self) -> Result<Vec<InferenceService>> {
        self.store.list().await
    }

    /// Healthy AVAILABLE services of any mode, in registry order
    pub async fn all_available(&self) -> Result<Vec<InferenceService>> {
        let now = Utc::now();
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|s| s.status == ServiceStatus::Available)
            .filter(|s| s.is_healthy(now, self.heartbeat_timeout))
            .collect())
    }

    /// Healthy AVAILABLE services matching `query`, shuffled
    pub async fn available(&self, query: &ServiceQuery) -> Result<Vec<InferenceService>> {
        let now = Utc::now();
        let mut services: Vec<InferenceService> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|s| s.status == ServiceStatus::Available)
            .filter(|s| s.is_healthy(now, self.heartbeat_timeout))
            .filter(|s| s.matches(query))
            .collect();
        services.shuffle(&mut rand::rng());
        Ok(services)
    }

    pub async fn lock(&self, service_id: &str, owner: &str) -> Result<InferenceService> {
        let owner_id = owner.to_string();
        let locked = self
            .store
            .modify(
                service_id,
                Box::new(move |s: &mut InferenceService| s.lock(&owner_id, Utc::now())),
            )
            .await?;
        info!(service_id, owner, "Service locked");
        Ok(locked)
    }

    /// Release the lock; `None` releases regardless of owner.
    /// Returns false when the service is missing or held by someone else.
    pub async fn release(&self, service_id: &str, owner: Option<&str>) -> Result<bool> {
        let owner_id = owner.map(str::to_string);
        match self
            .store
            .modify(
                service_id,
                Box::new(move |s: &mut InferenceService| s.release(owner_id.as_deref())),
            )
            .await
        {
            Ok(_) => {
                info!(service_id, "Service lock released");
                Ok(true)
            }
            Err(ParleyError::ServiceNotFound(_)) | Err(ParleyError::LockContention(_)) => {
                warn!(service_id, ?owner, "Lock release refused");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn renew(&self, service_id: &str, owner: &str) -> Result<bool> {
        let owner_id = owner.to_string();
        match self
            .store
            .modify(service_id, Box::new(move |s: &mut InferenceService| s.renew(&owner_id, Utc::now())))
            .await
        {
            Ok(_) => Ok(true),
            Err(ParleyError::ServiceNotFound(_)) | Err(ParleyError::LockContention(_)) => {
                warn!(service_id, owner, "Lock renewal refused");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Service currently locked by `owner`
    pub async fn held_by(&self, owner: &str) -> Result<Option<InferenceService>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .find(|s| s.status == ServiceStatus::Busy && s.locked_by.as_deref() == Some(owner)))
    }

    pub async fn busy(&self) -> Result<Vec<InferenceService>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|s| s.status == ServiceStatus::Busy)
            .collect())
    }

    /// Release BUSY locks older than the lock timeout
    pub async fn cleanup_expired_locks(&self) -> Result<usize> {
        let now = Utc::now();
        let mut released = 0;
        for service in self.store.list().await? {
            if service.lock_expired(now, self.lock_timeout) {
                info!(
                    service_id = %service.service_id,
                    owner = ?service.locked_by,
                    "Releasing expired lock"
                );
                if self
                    .release(&service.service_id, service.locked_by.as_deref())
                    .await?
                {
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    /// Mark services with stale heartbeats OFFLINE
    pub async fn cleanup_offline_services(&self) -> Result<usize> {
        let now = Utc::now();
        let mut marked = 0;
        for service in self.store.list().await? {
            if service.status != ServiceStatus::Offline
                && !service.is_healthy(now, self.heartbeat_timeout)
            {
                self.mark_offline(&service.service_id).await?;
                marked += 1;
            }
        }
        Ok(marked)
    }

    pub async fn mark_offline(&self, service_id: &str) -> Result<InferenceService> {
        let service = self
            .store
            .modify(service_id, Box::new(|s: &mut InferenceService| {
                s.mark_offline();
                Ok(())
            }))
            .await?;
        warn!(service_id, "Service marked offline");
        Ok(service)
    }

    pub async fn recover(&self, service_id: &str) -> Result<InferenceService> {
        let service = self
            .store
            .modify(service_id, Box::new(|s: &mut InferenceService| {
                s.recover(Utc::now());
                Ok(())
            }))
            .await?;
        info!(service_id, "Service back online");
        Ok(service)
    }

    pub async fn touch(&self, service_id: &str) -> Result<InferenceService> {
        self.store
            .modify(service_id, Box::new(|s: &mut InferenceService| {
                s.touch(Utc::now());
                Ok(())
            }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::service::ModelType;
    use crate::pool::store::MemoryStore;

    fn manager() -> ServiceManager {
        ServiceManager::new(Arc::new(MemoryStore::new()), &InferenceServiceConfig::default())
    }

    fn registration(port: u16, model_type: ModelType) -> ServiceRegistration {
        ServiceRegistration {
            ip: "127.0.0.1".into(),
            port,
            model_port: port,
            service_name: "o45-cpp".into(),
            model_type,
            session_type: "release".into(),
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let m = manager();
        let id = m.register(registration(9000, ModelType::Simplex)).await.unwrap();
        m.lock(&id, "u1").await.unwrap();
        m.register(registration(9000, ModelType::Simplex)).await.unwrap();

        let all = m.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, ServiceStatus::Available);
        assert!(m.unregister(&id).await.unwrap());
        assert!(!m.unregister(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_available_filters_busy_and_mode() {
        let m = manager();
        let a = m.register(registration(9000, ModelType::Simplex)).await.unwrap();
        m.register(registration(9001, ModelType::Duplex)).await.unwrap();
        m.register(registration(9002, ModelType::Release)).await.unwrap();
        m.lock(&a, "u1").await.unwrap();

        let query = ServiceQuery {
            model_type: Some(ModelType::Simplex),
            ..Default::default()
        };
        let found = m.available(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].service_id, "127.0.0.1:9002");
    }

    #[tokio::test]
    async fn test_stale_heartbeat_excluded() {
        let m = manager().with_timeouts(Duration::milliseconds(1), Duration::seconds(200));
        m.register(registration(9000, ModelType::Release)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(m.available(&ServiceQuery::default()).await.unwrap().is_empty());
        assert_eq!(m.cleanup_offline_services().await.unwrap(), 1);
        let s = m.get("127.0.0.1:9000").await.unwrap().unwrap();
        assert_eq!(s.status, ServiceStatus::Offline);
    }

    #[tokio::test]
    async fn test_expired_lock_swept() {
        let m = manager().with_timeouts(Duration::seconds(20), Duration::milliseconds(1));
        let id = m.register(registration(9000, ModelType::Simplex)).await.unwrap();
        m.lock(&id, "crashed").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(m.cleanup_expired_locks().await.unwrap(), 1);
        let s = m.get(&id).await.unwrap().unwrap();
        assert_eq!(s.status, ServiceStatus::Available);
        assert!(s.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_held_by_and_renew() {
        let m = manager();
        let id = m.register(registration(9000, ModelType::Simplex)).await.unwrap();
        m.lock(&id, "u1").await.unwrap();
        assert_eq!(m.held_by("u1").await.unwrap().unwrap().service_id, id);
        assert!(m.held_by("u2").await.unwrap().is_none());
        assert!(m.renew(&id, "u1").await.unwrap());
        assert!(!m.renew(&id, "u2").await.unwrap());
        assert!(!m.release("missing:1", None).await.unwrap());
    }
}

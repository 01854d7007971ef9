//! Background liveness checks for registered backends

use super::manager::ServiceManager;
use super::service::{InferenceService, ServiceStatus};
use crate::config::HeartbeatConfig;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_healthy(&self, service: &InferenceService) -> bool;
}

/// `GET http://ip:port+1/health`, healthy on 200
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn is_healthy(&self, service: &InferenceService) -> bool {
        match self.client.get(service.health_url()).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                debug!(service_id = %service.service_id, status = %resp.status(), "Health check failed");
                false
            }
            Err(e) => {
                debug!(service_id = %service.service_id, "Health check error: {}", e);
                false
            }
        }
    }
}

/// What one monitoring pass did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub skipped: bool,
    pub healthy: usize,
    pub marked_offline: usize,
    pub removed: usize,
    pub recovered: usize,
    pub expired_locks: usize,
}

pub struct HeartbeatMonitor {
    manager: ServiceManager,
    probe: Arc<dyn HealthProbe>,
    config: HeartbeatConfig,
    instance_id: String,
    last_cleanup: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(manager: ServiceManager, probe: Arc<dyn HealthProbe>, config: HeartbeatConfig) -> Self {
        Self {
            manager,
            probe,
            config,
            instance_id: format!("heartbeat_monitor_{}", uuid::Uuid::new_v4()),
            last_cleanup: None,
        }
    }

    /// One probe pass, guarded by the cross-instance lease
    pub async fn run_once(&mut self) -> Result<PassReport> {
        let store = self.manager.store().clone();
        if !store
            .try_acquire_lease(&self.config.lock_key, &self.instance_id, self.config.lease_ttl())
            .await?
        {
            debug!("Heartbeat lease held by another instance");
            return Ok(PassReport {
                skipped: true,
                ..Default::default()
            });
        }

        let result = self.probe_all().await;
        store
            .release_lease(&self.config.lock_key, &self.instance_id)
            .await?;
        result
    }

    async fn probe_all(&mut self) -> Result<PassReport> {
        let mut report = PassReport::default();

        for service in self.manager.all().await? {
            if let Err(e) = self.probe_one(&service, &mut report).await {
                warn!(service_id = %service.service_id, "Heartbeat step failed: {}", e);
            }
        }

        let cleanup_due = self
            .last_cleanup
            .map(|at| at.elapsed() >= self.config.cleanup_interval())
            .unwrap_or(true);
        if cleanup_due {
            report.expired_locks = self.manager.cleanup_expired_locks().await?;
            self.last_cleanup = Some(Instant::now());
        }

        Ok(report)
    }

    async fn probe_one(&self, service: &InferenceService, report: &mut PassReport) -> Result<()> {
        let id = service.service_id.as_str();
        if self.probe.is_healthy(service).await {
            if service.status == ServiceStatus::Offline {
                self.manager.recover(id).await?;
                report.recovered += 1;
            } else {
                // Only the heartbeat changes, the lock state is re-read
                self.manager.touch(id).await?;
                report.healthy += 1;
            }
            return Ok(());
        }

        warn!(service_id = id, status = %service.status, "Service failed health check");
        if service.locked_by.is_some() {
            self.manager.release(id, None).await?;
        }
        if service.status == ServiceStatus::Offline {
            if self.manager.unregister(id).await? {
                report.removed += 1;
            }
        } else {
            self.manager.mark_offline(id).await?;
            report.marked_offline += 1;
        }
        Ok(())
    }

    /// Loop until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval = self.config.monitoring_interval,
            "Heartbeat monitor started"
        );
        loop {
            match self.run_once().await {
                Ok(report) if !report.skipped => debug!(?report, "Heartbeat pass finished"),
                Ok(_) => {}
                Err(e) => error!("Heartbeat pass failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.monitoring_interval()) => {}
            }
        }
        info!("Heartbeat monitor stopped");
    }
}

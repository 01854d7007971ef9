use crate::{ParleyError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Available,
    Busy,
    Offline,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceStatus::Available => "available",
            ServiceStatus::Busy => "busy",
            ServiceStatus::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Turn discipline a backend serves. `Release` backends accept either.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Simplex,
    Duplex,
    Release,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Simplex => "simplex",
            ModelType::Duplex => "duplex",
            ModelType::Release => "release",
        }
    }

    pub fn is_duplex(&self) -> bool {
        matches!(self, ModelType::Duplex)
    }
}

impl FromStr for ModelType {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simplex" => Ok(ModelType::Simplex),
            "duplex" => Ok(ModelType::Duplex),
            "release" => Ok(ModelType::Release),
            other => Err(ParleyError::ProtocolError(format!(
                "Unsupported model type: {}",
                other
            ))),
        }
    }
}

/// Registration payload sent by a worker
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub ip: String,
    pub port: u16,
    pub model_port: u16,
    pub service_name: String,
    pub model_type: ModelType,
    pub session_type: String,
}

/// Filter for selecting backends
#[derive(Clone, Debug, Default)]
pub struct ServiceQuery {
    pub model_type: Option<ModelType>,
    pub session_type: Option<String>,
    pub service_name: Option<String>,
}

/// One registered backend instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceService {
    pub service_id: String,
    pub ip: String,
    pub port: u16,
    pub model_port: u16,
    pub service_name: String,
    pub model_type: ModelType,
    pub session_type: String,
    pub status: ServiceStatus,
    pub heartbeat_time: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub lock_time: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
}

pub fn service_id(ip: &str, port: u16) -> String {
    format!("{}:{}", ip, port)
}

impl InferenceService {
    pub fn from_registration(reg: ServiceRegistration, now: DateTime<Utc>) -> Self {
        Self {
            service_id: service_id(&reg.ip, reg.port),
            ip: reg.ip,
            port: reg.port,
            model_port: reg.model_port,
            service_name: reg.service_name,
            model_type: reg.model_type,
            session_type: reg.session_type,
            status: ServiceStatus::Available,
            heartbeat_time: now,
            locked_by: None,
            lock_time: None,
            create_time: now,
        }
    }

    /// Base URL of the model endpoints
    pub fn model_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.model_port)
    }

    /// Base URL of the out-of-band control listener
    pub fn control_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.model_port.saturating_add(1))
    }

    pub fn health_url(&self) -> String {
        format!("http://{}:{}/health", self.ip, self.port.saturating_add(1))
    }

    pub fn is_healthy(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.heartbeat_time <= timeout
    }

    pub fn matches(&self, query: &ServiceQuery) -> bool {
        if let Some(name) = &query.service_name {
            if &self.service_name != name {
                return false;
            }
        }
        if self.model_type == ModelType::Release {
            return true;
        }
        match query.model_type {
            Some(wanted) if wanted == self.model_type => {
                self.session_type == ModelType::Release.as_str()
                    || query.session_type.as_deref() == Some(self.session_type.as_str())
            }
            _ => false,
        }
    }

    /// AVAILABLE -> BUSY, or re-lock by the current owner
    pub fn lock(&mut self, owner: &str, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            ServiceStatus::Offline => Err(ParleyError::LockContention(format!(
                "{} is offline",
                self.service_id
            ))),
            ServiceStatus::Busy if self.locked_by.as_deref() != Some(owner) => {
                Err(ParleyError::LockContention(self.service_id.clone()))
            }
            _ => {
                self.status = ServiceStatus::Busy;
                self.locked_by = Some(owner.to_string());
                self.lock_time = Some(now);
                Ok(())
            }
        }
    }

    /// BUSY -> AVAILABLE. `None` forces the release regardless of owner.
    pub fn release(&mut self, owner: Option<&str>) -> Result<()> {
        if let Some(owner) = owner {
            if self.locked_by.as_deref() != Some(owner) {
                return Err(ParleyError::LockContention(format!(
                    "{} is not held by {}",
                    self.service_id, owner
                )));
            }
        }
        self.status = ServiceStatus::Available;
        self.locked_by = None;
        self.lock_time = None;
        Ok(())
    }

    pub fn renew(&mut self, owner: &str, now: DateTime<Utc>) -> Result<()> {
        if self.status != ServiceStatus::Busy || self.locked_by.as_deref() != Some(owner) {
            return Err(ParleyError::LockContention(format!(
                "{} is not held by {}",
                self.service_id, owner
            )));
        }
        self.lock_time = Some(now);
        Ok(())
    }

    pub fn lock_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match (self.status, self.lock_time) {
            (ServiceStatus::Busy, Some(at)) => now - at > timeout,
            _ => false,
        }
    }

    /// Failed probe: drop any lock and go OFFLINE
    pub fn mark_offline(&mut self) {
        self.status = ServiceStatus::Offline;
        self.locked_by = None;
        self.lock_time = None;
    }

    /// Successful probe after being OFFLINE
    pub fn recover(&mut self, now: DateTime<Utc>) {
        self.status = ServiceStatus::Available;
        self.locked_by = None;
        self.lock_time = None;
        self.heartbeat_time = now;
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.heartbeat_time = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(model_type: ModelType, session_type: &str) -> InferenceService {
        InferenceService::from_registration(
            ServiceRegistration {
                ip: "10.0.0.1".into(),
                port: 8060,
                model_port: 8060,
                service_name: "o45-cpp".into(),
                model_type,
                session_type: session_type.into(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_identity_and_urls() {
        let s = service(ModelType::Simplex, "release");
        assert_eq!(s.service_id, "10.0.0.1:8060");
        assert_eq!(s.control_url(), "http://10.0.0.1:8061");
        assert_eq!(s.health_url(), "http://10.0.0.1:8061/health");
        assert_eq!(s.status, ServiceStatus::Available);
    }

    #[test]
    fn test_lock_transitions() {
        let mut s = service(ModelType::Simplex, "release");
        let now = Utc::now();
        s.lock("u1", now).unwrap();
        assert_eq!(s.status, ServiceStatus::Busy);
        assert!(s.lock("u2", now).is_err());
        assert_eq!(s.locked_by.as_deref(), Some("u1"));

        assert!(s.release(Some("u2")).is_err());
        assert!(s.renew("u2", now).is_err());
        s.renew("u1", now).unwrap();
        s.release(Some("u1")).unwrap();
        assert_eq!(s.status, ServiceStatus::Available);
        assert!(s.locked_by.is_none());
    }

    #[test]
    fn test_offline_cannot_be_locked() {
        let mut s = service(ModelType::Duplex, "release");
        s.lock("u1", Utc::now()).unwrap();
        s.mark_offline();
        assert!(s.locked_by.is_none());
        assert!(s.lock("u2", Utc::now()).is_err());
        s.recover(Utc::now());
        assert!(s.lock("u2", Utc::now()).is_ok());
    }

    #[test]
    fn test_matching_rules() {
        let simplex_query = ServiceQuery {
            model_type: Some(ModelType::Simplex),
            session_type: Some("vip".into()),
            service_name: None,
        };

        assert!(service(ModelType::Release, "anything").matches(&simplex_query));
        assert!(service(ModelType::Simplex, "release").matches(&simplex_query));
        assert!(service(ModelType::Simplex, "vip").matches(&simplex_query));
        assert!(!service(ModelType::Simplex, "basic").matches(&simplex_query));
        assert!(!service(ModelType::Duplex, "release").matches(&simplex_query));

        let named = ServiceQuery {
            service_name: Some("other".into()),
            ..simplex_query
        };
        assert!(!service(ModelType::Release, "release").matches(&named));
    }

    #[test]
    fn test_lock_expiry() {
        let mut s = service(ModelType::Simplex, "release");
        let t0 = Utc::now();
        s.lock("u1", t0).unwrap();
        assert!(!s.lock_expired(t0 + Duration::seconds(100), Duration::seconds(200)));
        assert!(s.lock_expired(t0 + Duration::seconds(201), Duration::seconds(200)));
    }
}

pub mod heartbeat;
pub mod manager;
pub mod service;
pub mod store;

pub use heartbeat::{HealthProbe, HeartbeatMonitor, HttpProbe, PassReport};
pub use manager::ServiceManager;
pub use service::{
    service_id, InferenceService, ModelType, ServiceQuery, ServiceRegistration, ServiceStatus,
};
pub use store::{MemoryStore, ServiceStore};

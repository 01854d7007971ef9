//! Per-user streaming sessions on the gateway

pub mod backend;
pub mod model;
pub mod queue;
pub mod room;
pub mod state;
pub mod stream;

pub use backend::{HttpBackend, OmniBackend};
pub use model::{outbound_channel, ModelCaller, Outbound, OutboundReceiver, OutboundSender, OutputSink, Outputs, StateMarker};
pub use queue::DropOldestQueue;
pub use state::{SessionParams, SessionState, SharedState};

use crate::config::VoiceChatConfig;
use crate::pool::{InferenceService, ServiceManager};
use crate::vad::VadPool;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A service lock held on behalf of one user
#[derive(Clone)]
pub struct Lease {
    manager: ServiceManager,
    service_id: String,
    owner: String,
}

impl Lease {
    pub fn new(manager: ServiceManager, service_id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            manager,
            service_id: service_id.into(),
            owner: owner.into(),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub async fn renew(&self) {
        if let Err(e) = self.manager.renew(&self.service_id, &self.owner).await {
            warn!(service_id = %self.service_id, "lock renewal failed: {}", e);
        }
    }

    pub async fn release(&self) {
        match self.manager.release(&self.service_id, Some(&self.owner)).await {
            Ok(_) => debug!(service_id = %self.service_id, "lock released"),
            Err(e) => warn!(service_id = %self.service_id, "lock release failed: {}", e),
        }
    }
}

/// Everything a session needs besides its own options
#[derive(Clone)]
pub struct SessionContext {
    pub manager: ServiceManager,
    pub vad: Arc<VadPool>,
    pub voice_chat: VoiceChatConfig,
}

/// A logged-in user with a locked service, waiting for the media attach
#[derive(Clone)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub service: InferenceService,
    pub params: SessionParams,
    pub lease: Lease,
    pub backend: Arc<dyn OmniBackend>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Sessions handed out at login, keyed by their token
#[derive(Default)]
pub struct SessionHub {
    pending: Mutex<HashMap<String, Session>>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: String, session: Session) {
        info!(session_id = %session.session_id, "session waiting for attach");
        self.pending.lock().insert(token, session);
    }

    /// Take the session for a token
    pub fn claim(&self, token: &str) -> Option<Session> {
        self.pending.lock().remove(token)
    }

    /// Drop pending sessions of a user, returning them so their leases can
    /// be released
    pub fn remove_user(&self, user_id: &str) -> Vec<Session> {
        let mut pending = self.pending.lock();
        let tokens: Vec<String> = pending
            .iter()
            .filter(|(_, s)| s.user_id == user_id)
            .map(|(t, _)| t.clone())
            .collect();
        tokens.iter().filter_map(|t| pending.remove(t)).collect()
    }

    /// Remove sessions whose token expired before they attached
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<Session> {
        let mut pending = self.pending.lock();
        let tokens: Vec<String> = pending
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(t, _)| t.clone())
            .collect();
        tokens.iter().filter_map(|t| pending.remove(t)).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

pub fn token_ttl(config: &VoiceChatConfig) -> Duration {
    Duration::seconds(config.token_ttl as i64)
}

//! Session gateway: login API, media attach and the service pool

pub mod login;
pub mod registry;

use crate::api::cors;
use crate::config::Settings;
use crate::pool::{HeartbeatMonitor, HttpProbe, InferenceService, MemoryStore, ServiceManager, ServiceStore};
use crate::session::{HttpBackend, OmniBackend, SessionContext, SessionHub};
use crate::vad::{default_scorer_factory, VadPool};
use crate::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, Instrument};

/// Builds the client a session uses to talk to its locked service
pub type BackendFactory = Arc<dyn Fn(&InferenceService) -> Result<Arc<dyn OmniBackend>> + Send + Sync>;

pub fn http_backend_factory() -> BackendFactory {
    Arc::new(|service: &InferenceService| {
        Ok(Arc::new(HttpBackend::for_service(service)?) as Arc<dyn OmniBackend>)
    })
}

#[derive(Clone)]
pub struct GatewayState {
    pub manager: ServiceManager,
    pub hub: Arc<SessionHub>,
    pub ctx: SessionContext,
    pub backend_factory: BackendFactory,
}

pub fn create_router(state: GatewayState) -> Router {
    let inference = Router::new()
        .route("/register", post(registry::register))
        .route("/unregister/{service_id}", delete(registry::unregister))
        .route("/services", get(registry::services));

    Router::new()
        .route("/api/login", post(login::login))
        .route("/api/logout", post(login::logout))
        .route("/api/system_time", get(login::system_time))
        .route("/ws/session", get(login::attach))
        .nest("/api/inference", inference)
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .with_state(state)
}

/// Release locks of sessions that logged in but never attached
async fn sweep_pending(hub: Arc<SessionHub>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for session in hub.take_expired(chrono::Utc::now()) {
            info!(session_id = %session.session_id, "token expired before attach");
            session.lease.release().await;
        }
    }
}

pub async fn run(settings: Settings, shutdown: CancellationToken) -> Result<()> {
    let store: Arc<dyn ServiceStore> = match &settings.inference_service.store_path {
        Some(path) => Arc::new(MemoryStore::with_snapshot(path)?),
        None => Arc::new(MemoryStore::new()),
    };
    let manager = ServiceManager::new(store, &settings.inference_service);
    let vad = Arc::new(VadPool::new(settings.voice_chat.vad_workers, default_scorer_factory())?);
    let hub = Arc::new(SessionHub::new());

    let probe = Arc::new(HttpProbe::new(settings.heartbeat.probe_timeout())?);
    let monitor = HeartbeatMonitor::new(manager.clone(), probe, settings.heartbeat.clone());
    tokio::spawn(
        monitor
            .run(shutdown.clone())
            .instrument(tracing::info_span!("heartbeat")),
    );
    tokio::spawn(sweep_pending(hub.clone(), shutdown.clone()));

    let state = GatewayState {
        manager: manager.clone(),
        hub,
        ctx: SessionContext {
            manager,
            vad,
            voice_chat: settings.voice_chat.clone(),
        },
        backend_factory: http_backend_factory(),
    };

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("Gateway stopped");
    Ok(())
}

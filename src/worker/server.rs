//! Worker HTTP surface
//!
//! The main listener serves the whole `/omni/*` API. A side listener on
//! `port + 1` serves health, break and stop so those keep answering while
//! a generate stream occupies the main one.

use super::process::Supervisor;
use super::Driver;
use crate::api::{cors, ApiResult};
use crate::config::WorkerConfig;
use crate::pool::{ModelType, ServiceRegistration};
use crate::protocol::{InitRequest, InitResponse, PrefillRequest, PrefillResponse};
use crate::Result;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Delay between the end of a generate stream and the GPU memory check
const GPU_CHECK_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct WorkerState {
    pub supervisor: Arc<Supervisor>,
}

impl WorkerState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    pub fn driver(&self) -> &Arc<Driver> {
        self.supervisor.driver()
    }
}

pub fn main_router(state: WorkerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/omni/init_sys_prompt", post(init_sys_prompt))
        .route("/omni/streaming_prefill", post(streaming_prefill))
        .route("/omni/streaming_generate", post(streaming_generate))
        .route("/omni/break", post(break_generation))
        .route("/omni/stop", post(stop))
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .with_state(state)
}

pub fn side_router(state: WorkerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/omni/break", post(break_generation))
        .route("/omni/stop", post(stop))
        .layer(cors())
        .with_state(state)
}

async fn health(State(state): State<WorkerState>) -> Json<Value> {
    let driver = state.driver();
    Json(json!({
        "status": "healthy",
        "backend": "stream-engine",
        "duplex_mode": driver.duplex_mode().await,
        "restarting": driver.is_restarting(),
        "session_id": driver.session_id().await,
    }))
}

async fn init_sys_prompt(
    State(state): State<WorkerState>,
    Json(request): Json<InitRequest>,
) -> ApiResult<Json<InitResponse>> {
    Ok(Json(state.driver().init_session(request).await?))
}

async fn streaming_prefill(
    State(state): State<WorkerState>,
    Json(request): Json<PrefillRequest>,
) -> ApiResult<Json<PrefillResponse>> {
    Ok(Json(state.driver().prefill(request).await?))
}

async fn streaming_generate(
    State(state): State<WorkerState>,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let mut events = state.driver().generate().await?;
    let supervisor = state.supervisor.clone();

    let stream = async_stream::stream! {
        while let Some(event) = events.next().await {
            match serde_json::to_string(&event) {
                Ok(data) => yield Ok(Event::default().data(data)),
                Err(e) => warn!("failed to encode generate event: {}", e),
            }
        }
        tokio::spawn(async move {
            tokio::time::sleep(GPU_CHECK_DELAY).await;
            supervisor.check_memory().await;
        });
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn break_generation(State(state): State<WorkerState>) -> ApiResult<Json<Value>> {
    state.driver().break_generation().await?;
    Ok(Json(json!({
        "success": true,
        "message": "Generation break requested",
        "state": "break",
    })))
}

async fn stop(State(state): State<WorkerState>) -> Json<Value> {
    let session_id = state.driver().stop().await;
    Json(json!({
        "success": true,
        "message": "Generation stopped",
        "state": "generation_stopped",
        "session_id": session_id,
        "kv_cache_preserved": true,
    }))
}

/// Address the gateway should use to reach this worker
pub fn advertise_ip(config: &WorkerConfig) -> String {
    if let Some(ip) = &config.advertise_ip {
        return ip.clone();
    }
    // Connecting a UDP socket sends nothing, it only resolves the outbound interface
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

pub fn registration(config: &WorkerConfig) -> ServiceRegistration {
    ServiceRegistration {
        ip: advertise_ip(config),
        port: config.port,
        model_port: config.port,
        service_name: config.service_name.clone(),
        model_type: if config.duplex {
            ModelType::Duplex
        } else {
            ModelType::Simplex
        },
        session_type: ModelType::Release.as_str().to_string(),
    }
}

/// Announce this worker to the gateway registry, retrying a few times while
/// the gateway comes up
pub async fn register_with_gateway(register_url: &str, registration: &ServiceRegistration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let url = format!("{}/api/inference/register", register_url.trim_end_matches('/'));

    let mut last_error = None;
    for attempt in 1..=5u32 {
        match client.post(&url).json(registration).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(url = %url, ip = %registration.ip, port = registration.port, "registered with gateway");
                return Ok(());
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                debug!(attempt, %status, "registration rejected: {}", body);
                last_error = Some(crate::ParleyError::backend(Some(status.as_u16()), body));
            }
            Err(e) => {
                debug!(attempt, "registration failed: {}", e);
                last_error = Some(e.into());
            }
        }
        tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
    }
    Err(last_error.unwrap_or_else(|| crate::ParleyError::backend(None, "registration failed")))
}

//! Login, logout and media attach

use super::GatewayState;
use crate::api::{ApiError, ApiResult};
use crate::pool::{ModelType, ServiceQuery};
use crate::session::{room, token_ttl, Lease, Session, SessionParams};
use crate::ParleyError;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::Response,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub session_type: Option<String>,
    #[serde(default = "default_vad_time")]
    pub dur_vad_time: f32,
    #[serde(default = "default_vad_threshold")]
    pub dur_vad_threshold: f32,
    #[serde(default)]
    pub vad_race: bool,
    #[serde(default)]
    pub high_refresh: bool,
    #[serde(default)]
    pub high_image: bool,
    #[serde(default)]
    pub language: Option<String>,
}

fn default_model_type() -> String {
    "simplex".to_string()
}

fn default_vad_time() -> f32 {
    0.4
}

fn default_vad_threshold() -> f32 {
    0.1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub success: bool,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub token: String,
    pub message: String,
    pub expires_in: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    pub user_id: String,
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn login(
    State(state): State<GatewayState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let model_type: ModelType = request.model_type.parse()?;
    let query = ServiceQuery {
        model_type: Some(model_type),
        session_type: request.session_type.clone(),
        service_name: request.service_name.clone(),
    };

    let user_id = uuid::Uuid::new_v4().to_string();
    let session_id = uuid::Uuid::new_v4().to_string();

    let mut locked = None;
    for candidate in state.manager.available(&query).await? {
        match state.manager.lock(&candidate.service_id, &user_id).await {
            Ok(service) => {
                locked = Some(service);
                break;
            }
            Err(ParleyError::LockContention(id)) => {
                info!(service_id = %id, "candidate taken, trying the next one");
            }
            Err(e) => return Err(e.into()),
        }
    }
    let Some(service) = locked else {
        warn!(model_type = model_type.as_str(), "no inference service available");
        return Err(ApiError::unavailable(ParleyError::NoCapacity.user_message()));
    };

    let lease = Lease::new(state.manager.clone(), service.service_id.clone(), user_id.clone());
    let backend = match (state.backend_factory)(&service) {
        Ok(backend) => backend,
        Err(e) => {
            lease.release().await;
            return Err(e.into());
        }
    };

    let params = SessionParams {
        model_type,
        vad_tail_seconds: request.dur_vad_time,
        vad_offset: request.dur_vad_threshold,
        vad_race: request.vad_race,
        high_fps: request.high_refresh,
        high_quality: request.high_image,
        language: request.language,
    };
    let ttl = token_ttl(&state.ctx.voice_chat);
    let token = uuid::Uuid::new_v4().simple().to_string();
    state.hub.insert(
        token.clone(),
        Session {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            service: service.clone(),
            params,
            lease,
            backend,
            expires_at: Utc::now() + ttl,
        },
    );

    info!(
        user_id = %user_id,
        session_id = %session_id,
        service_id = %service.service_id,
        "login"
    );
    Ok(Json(LoginResponse {
        success: true,
        user_id,
        session_id,
        token,
        message: "Login successful".to_string(),
        expires_in: ttl.num_seconds().max(0) as u64,
    }))
}

pub async fn logout(
    State(state): State<GatewayState>,
    Json(request): Json<LogoutRequest>,
) -> ApiResult<Json<Value>> {
    for pending in state.hub.remove_user(&request.user_id) {
        pending.lease.release().await;
    }

    // Locks of vanished holders are left to the expired-lock sweep
    let released = match state.manager.held_by(&request.user_id).await? {
        Some(service) => state
            .manager
            .release(&service.service_id, Some(&request.user_id))
            .await?,
        None => false,
    };

    info!(user_id = %request.user_id, released, "logout");
    Ok(Json(json!({
        "success": true,
        "released": released,
        "message": "Logout successful",
    })))
}

pub async fn system_time() -> Json<Value> {
    let now = Utc::now();
    Json(json!({
        "timestamp": now.timestamp_millis(),
        "iso": now.to_rfc3339(),
    }))
}

#[derive(Deserialize)]
pub struct AttachQuery {
    pub token: String,
}

pub async fn attach(
    State(state): State<GatewayState>,
    Query(query): Query<AttachQuery>,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    let session = state
        .hub
        .claim(&query.token)
        .ok_or_else(|| ApiError::unauthorized("Invalid token"))?;
    if session.is_expired(Utc::now()) {
        session.lease.release().await;
        return Err(ApiError::unauthorized("Token expired"));
    }
    let ctx = state.ctx.clone();
    Ok(upgrade.on_upgrade(move |socket| room::serve(socket, session, ctx)))
}

//! Service pool endpoints used by workers and operators

use super::GatewayState;
use crate::api::{ApiError, ApiResult};
use crate::pool::{InferenceService, ServiceRegistration};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

pub async fn register(
    State(state): State<GatewayState>,
    Json(registration): Json<ServiceRegistration>,
) -> ApiResult<Json<Value>> {
    let service_id = state.manager.register(registration).await?;
    Ok(Json(json!({
        "success": true,
        "service_id": service_id,
        "message": "Service registered",
    })))
}

pub async fn unregister(
    State(state): State<GatewayState>,
    Path(service_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.manager.unregister(&service_id).await? {
        return Err(ApiError::not_found(format!("Service not found: {}", service_id)));
    }
    Ok(Json(json!({
        "success": true,
        "message": "Service unregistered",
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ServicesQuery {
    #[serde(default)]
    pub available_only: bool,
}

pub async fn services(
    State(state): State<GatewayState>,
    Query(query): Query<ServicesQuery>,
) -> ApiResult<Json<Value>> {
    let services: Vec<InferenceService> = if query.available_only {
        state.manager.all_available().await?
    } else {
        state.manager.all().await?
    };

    Ok(Json(json!({
        "success": true,
        "total": services.len(),
        "services": services,
    })))
}

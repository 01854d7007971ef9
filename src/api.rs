//! HTTP error mapping shared by the gateway and worker routers

use crate::ParleyError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: msg.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "detail": self.message,
            "code": self.status.as_u16(),
        }));
        (self.status, body).into_response()
    }
}

impl From<ParleyError> for ApiError {
    fn from(err: ParleyError) -> Self {
        Self {
            status: StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: err.to_string(),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_error_kind() {
        assert_eq!(ApiError::from(ParleyError::EngineRestarting).status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ApiError::from(ParleyError::ServiceNotFound("a:1".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(ParleyError::IOError("disk".into())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

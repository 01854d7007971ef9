pub mod api;
pub mod audio;
pub mod config;
pub mod gateway;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod vad;
pub mod worker;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ParleyError {
    #[error("Audio processing error: {0}")]
    AudioProcessingError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("VAD error: {0}")]
    VadError(String),

    #[error("Backend error ({status:?}): {message}")]
    BackendError {
        status: Option<u16>,
        message: String,
    },

    #[error("Inference engine is restarting, retry later")]
    EngineRestarting,

    #[error("No inference service available")]
    NoCapacity,

    #[error("Service {0} is locked by another owner")]
    LockContention(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl From<std::io::Error> for ParleyError {
    fn from(e: std::io::Error) -> Self {
        ParleyError::IOError(e.to_string())
    }
}

impl From<reqwest::Error> for ParleyError {
    fn from(e: reqwest::Error) -> Self {
        ParleyError::BackendError {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(e: serde_json::Error) -> Self {
        ParleyError::ProtocolError(e.to_string())
    }
}

impl From<hound::Error> for ParleyError {
    fn from(e: hound::Error) -> Self {
        ParleyError::AudioProcessingError(e.to_string())
    }
}

impl From<image::ImageError> for ParleyError {
    fn from(e: image::ImageError) -> Self {
        ParleyError::ImageError(e.to_string())
    }
}

impl ParleyError {
    pub fn backend(status: Option<u16>, message: impl Into<String>) -> Self {
        ParleyError::BackendError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Non-2xx from prefill/decode, caller retries next cycle
            ParleyError::BackendError { .. } => true,
            ParleyError::EngineRestarting => true,
            // Caller picks another backend
            ParleyError::LockContention(_) => true,
            ParleyError::NoCapacity => true,
            ParleyError::AudioProcessingError(_) => true,
            ParleyError::ImageError(_) => true,
            ParleyError::VadError(_) => true,
            ParleyError::ProtocolError(_) => true,
            ParleyError::ServiceNotFound(_) => false,
            ParleyError::SessionError(_) => false,
            ParleyError::ConfigError(_) => false,
            ParleyError::IOError(_) => false,
            ParleyError::ChannelError(_) => false,
        }
    }

    /// HTTP status a handler should answer with for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ParleyError::EngineRestarting | ParleyError::NoCapacity => 503,
            ParleyError::LockContention(_) => 409,
            ParleyError::ServiceNotFound(_) => 404,
            ParleyError::ProtocolError(_) | ParleyError::SessionError(_) => 400,
            ParleyError::ImageError(_) | ParleyError::AudioProcessingError(_) => 400,
            _ => 500,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            ParleyError::NoCapacity | ParleyError::LockContention(_) => {
                "No inference service is available right now. Please try again later.".to_string()
            }
            ParleyError::EngineRestarting => {
                "The model is restarting. Please try again in a moment.".to_string()
            }
            ParleyError::ServiceNotFound(_) => {
                "The inference service went offline. The session has ended.".to_string()
            }
            ParleyError::BackendError { .. } => {
                "Model request failed. Please try again.".to_string()
            }
            ParleyError::SessionError(_) => "Session initialization failed.".to_string(),
            ParleyError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            ParleyError::ChannelError(_) => {
                "Internal communication error. Please reconnect.".to_string()
            }
            ParleyError::AudioProcessingError(_)
            | ParleyError::ImageError(_)
            | ParleyError::VadError(_)
            | ParleyError::ProtocolError(_) => "Media processing failed.".to_string(),
            ParleyError::IOError(_) => "File system error occurred.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_taxonomy() {
        assert!(ParleyError::backend(Some(500), "decode failed").is_recoverable());
        assert!(ParleyError::EngineRestarting.is_recoverable());
        assert!(ParleyError::LockContention("a:1".into()).is_recoverable());
        assert!(!ParleyError::ConfigError("bad".into()).is_recoverable());
        assert!(!ParleyError::ServiceNotFound("a:1".into()).is_recoverable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ParleyError::EngineRestarting.status_code(), 503);
        assert_eq!(ParleyError::NoCapacity.status_code(), 503);
        assert_eq!(ParleyError::ServiceNotFound("x".into()).status_code(), 404);
    }
}

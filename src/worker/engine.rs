//! HTTP client for the inference engine's `/v1/stream/*` API

use crate::{ParleyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Media type codes understood by the engine
pub const MEDIA_AUDIO: u8 = 1;
pub const MEDIA_OMNI: u8 = 2;

#[derive(Clone, Debug, Serialize)]
pub struct OmniInit {
    pub media_type: u8,
    pub use_tts: bool,
    pub duplex_mode: bool,
    pub model_dir: String,
    pub tts_bin_dir: String,
    pub output_dir: String,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_slice_nums: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionConfigUpdate {
    pub media_type: u8,
    pub duplex_mode: bool,
    pub language: String,
}

/// One prefill call. Paths are empty strings when the call carries no
/// audio or no image. `is_last_chunk` marks the closing call of a turn.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnginePrefill {
    pub audio_path_prefix: String,
    pub img_path_prefix: String,
    pub cnt: u64,
    pub is_last_chunk: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_slice_nums: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DecodeRequest {
    pub debug_dir: String,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_idx: Option<u32>,
}

/// Raw decode response body
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[async_trait]
pub trait StreamEngine: Send + Sync {
    async fn omni_init(&self, request: &OmniInit) -> Result<Value>;

    async fn update_session_config(&self, request: &SessionConfigUpdate) -> Result<Value>;

    async fn prefill(&self, request: &EnginePrefill) -> Result<()>;

    /// Start decoding. Resolves once the response headers arrive; the body
    /// runs until generation ends.
    async fn decode(&self, request: &DecodeRequest) -> Result<ByteStream>;

    async fn break_generation(&self) -> Result<()>;

    async fn health(&self) -> Result<bool>;
}

pub struct EngineClient {
    client: reqwest::Client,
    base_url: String,
    prefill_timeout: Duration,
    decode_timeout: Duration,
}

impl EngineClient {
    pub fn new(base_url: impl Into<String>, prefill_timeout: Duration, decode_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            prefill_timeout,
            decode_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .timeout(timeout)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ParleyError::backend(
                Some(status.as_u16()),
                format!("{} failed: {}", path, text),
            ));
        }
        debug!(path, "engine replied {}", status);
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[async_trait]
impl StreamEngine for EngineClient {
    async fn omni_init(&self, request: &OmniInit) -> Result<Value> {
        // Loads TTS and vision modules on first use
        self.post_json("/v1/stream/omni_init", request, Duration::from_secs(120))
            .await
    }

    async fn update_session_config(&self, request: &SessionConfigUpdate) -> Result<Value> {
        self.post_json("/v1/stream/update_session_config", request, self.prefill_timeout)
            .await
    }

    async fn prefill(&self, request: &EnginePrefill) -> Result<()> {
        self.post_json("/v1/stream/prefill", request, self.prefill_timeout)
            .await
            .map(|_| ())
    }

    async fn decode(&self, request: &DecodeRequest) -> Result<ByteStream> {
        let url = format!("{}/v1/stream/decode", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(request)
            .timeout(self.decode_timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ParleyError::backend(
                Some(status.as_u16()),
                format!("decode failed: {}", text),
            ));
        }
        Ok(resp.bytes_stream().map_err(ParleyError::from).boxed())
    }

    async fn break_generation(&self) -> Result<()> {
        self.post_json("/v1/stream/break", &json!({}), Duration::from_secs(5))
            .await
            .map(|_| ())
    }

    async fn health(&self) -> Result<bool> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await?;
        Ok(resp.status().is_success())
    }
}

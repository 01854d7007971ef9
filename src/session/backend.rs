//! Client for a locked worker's `/omni/*` surface

use crate::pool::InferenceService;
use crate::protocol::{GenerateEvent, InitRequest, InitResponse, PrefillRequest, PrefillResponse, SseDecoder};
use crate::{ParleyError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

const PREFILL_TIMEOUT: Duration = Duration::from_secs(10);
const INIT_TIMEOUT: Duration = Duration::from_secs(120);
const GENERATE_TIMEOUT: Duration = Duration::from_secs(600);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

pub type EventStream = BoxStream<'static, Result<GenerateEvent>>;

#[async_trait]
pub trait OmniBackend: Send + Sync {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse>;

    async fn prefill(&self, request: &PrefillRequest) -> Result<PrefillResponse>;

    async fn generate(&self) -> Result<EventStream>;

    /// Sent to the control port so it is served while generate runs
    async fn break_generation(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

pub struct HttpBackend {
    client: reqwest::Client,
    model_url: String,
    control_url: String,
}

impl HttpBackend {
    pub fn new(model_url: impl Into<String>, control_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            model_url: model_url.into(),
            control_url: control_url.into(),
        })
    }

    pub fn for_service(service: &InferenceService) -> Result<Self> {
        Self::new(service.model_url(), service.control_url())
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: String,
        body: &B,
        timeout: Duration,
    ) -> Result<R> {
        let resp = self
            .client
            .post(&url)
            .json(body)
            .timeout(timeout)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ParleyError::backend(Some(status.as_u16()), format!("{}: {}", url, text)));
        }
        Ok(resp.json::<R>().await?)
    }
}

#[async_trait]
impl OmniBackend for HttpBackend {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse> {
        self.post(format!("{}/omni/init_sys_prompt", self.model_url), request, INIT_TIMEOUT)
            .await
    }

    async fn prefill(&self, request: &PrefillRequest) -> Result<PrefillResponse> {
        self.post(format!("{}/omni/streaming_prefill", self.model_url), request, PREFILL_TIMEOUT)
            .await
    }

    async fn generate(&self) -> Result<EventStream> {
        let url = format!("{}/omni/streaming_generate", self.model_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({}))
            .timeout(GENERATE_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ParleyError::backend(Some(status.as_u16()), format!("generate: {}", text)));
        }

        let mut body = resp.bytes_stream();
        Ok(async_stream::stream! {
            let mut sse = SseDecoder::new();
            while let Some(bytes) = body.next().await {
                let bytes = match bytes {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(ParleyError::from(e));
                        return;
                    }
                };
                for payload in sse.push(&bytes) {
                    match parse_event(&payload) {
                        Some(event) => yield Ok(event),
                        None => debug!("skipping event payload: {}", payload),
                    }
                }
            }
            if let Some(payload) = sse.finish() {
                if let Some(event) = parse_event(&payload) {
                    yield Ok(event);
                }
            }
        }
        .boxed())
    }

    async fn break_generation(&self) -> Result<()> {
        let _: Value = self
            .post(format!("{}/omni/break", self.control_url), &json!({}), CONTROL_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _: Value = self
            .post(format!("{}/omni/stop", self.control_url), &json!({}), CONTROL_TIMEOUT)
            .await?;
        Ok(())
    }
}

fn parse_event(payload: &str) -> Option<GenerateEvent> {
    match serde_json::from_str::<GenerateEvent>(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("malformed generate event: {}", e);
            None
        }
    }
}

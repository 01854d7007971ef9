//! Gateway side of the prefill/generate protocol
//!
//! Encodes session media into worker requests, reads the generate stream
//! into the output queues and emits the state markers the front end follows.

use super::backend::OmniBackend;
use super::queue::DropOldestQueue;
use super::state::{SessionParams, SharedState};
use super::Lease;
use crate::audio::wav::encode_wav_base64;
use crate::audio::{i16_to_f32, pcm16_from_le_bytes, resample_audio, MODEL_SAMPLE_RATE, TRANSPORT_SAMPLE_RATE};
use crate::config::VoiceChatConfig;
use crate::protocol::{ChunkData, InitRequest, InitResponse, PrefillRequest};
use crate::{ParleyError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status lines sent to the front end as text messages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateMarker {
    ModelInitSuccess,
    ModelInitFailed,
    SessionInit,
    VadEnd,
    GenerateStart,
    GenerateFirstChunk,
    GenerateEnd,
    AudioStart,
    PlayEndSuccess,
    SessionBreak,
    SessionStop,
    RobotExit,
}

impl StateMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateMarker::ModelInitSuccess => "<state><model_init_success>",
            StateMarker::ModelInitFailed => "<state><model_init_failed>",
            StateMarker::SessionInit => "<state><session_init>",
            StateMarker::VadEnd => "<state><vad_end>",
            StateMarker::GenerateStart => "<state><generate_start>",
            StateMarker::GenerateFirstChunk => "<state><generate_first_chunk>",
            StateMarker::GenerateEnd => "<state><generate_end>",
            StateMarker::AudioStart => "<state><audio_start>",
            StateMarker::PlayEndSuccess => "<state><play_end_success>",
            StateMarker::SessionBreak => "<state><session_break>",
            StateMarker::SessionStop => "<state><session_stop>",
            StateMarker::RobotExit => "<state><robot_exit>",
        }
    }
}

/// Messages for the front end
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Text(String),
    /// One 20 ms PCM16 frame at the transport rate
    Audio(Vec<i16>),
    Close,
}

/// Sending half of the front-end connection
///
/// Audio frames travel on a bounded lane and are dropped when it is full.
/// Text and `Close` use their own lane and are never dropped.
#[derive(Clone)]
pub struct OutboundSender {
    control: mpsc::UnboundedSender<Outbound>,
    frames: mpsc::Sender<Vec<i16>>,
}

pub struct OutboundReceiver {
    control: mpsc::UnboundedReceiver<Outbound>,
    frames: mpsc::Receiver<Vec<i16>>,
}

pub fn outbound_channel(frame_capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (frames_tx, frames_rx) = mpsc::channel(frame_capacity.max(1));
    (
        OutboundSender {
            control: control_tx,
            frames: frames_tx,
        },
        OutboundReceiver {
            control: control_rx,
            frames: frames_rx,
        },
    )
}

impl OutboundSender {
    /// Returns false when the message was not queued
    pub fn send(&self, message: Outbound) -> bool {
        match message {
            Outbound::Audio(frame) => match self.frames.try_send(frame) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("outbound frame queue full, dropping frame");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            },
            other => self.control.send(other).is_ok(),
        }
    }
}

impl OutboundReceiver {
    /// Next message; control messages win when both lanes are ready
    pub async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            Some(message) = self.control.recv() => Some(message),
            Some(frame) = self.frames.recv() => Some(Outbound::Audio(frame)),
            else => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        match self.control.try_recv() {
            Ok(message) => Some(message),
            Err(_) => self.frames.try_recv().ok().map(Outbound::Audio),
        }
    }
}

/// Generated audio (transport rate) and text waiting to go out
pub struct Outputs {
    pub audio: DropOldestQueue<Vec<f32>>,
    pub text: DropOldestQueue<String>,
}

impl Outputs {
    pub fn new(config: &VoiceChatConfig) -> Self {
        Self {
            audio: DropOldestQueue::new(config.audio_output_queue),
            text: DropOldestQueue::new(config.text_queue),
        }
    }

    pub fn clear(&self) {
        self.audio.clear();
        self.text.clear();
    }
}

/// Where one generate call writes its output
///
/// A raced generate writes into a side buffer until the turn is confirmed;
/// promotion moves the buffered output to the real queues, replays the
/// state markers held back meanwhile and routes the rest of the stream
/// there.
pub struct OutputSink {
    real: Arc<Outputs>,
    side: Option<Outputs>,
    inner: Mutex<SinkState>,
}

#[derive(Default)]
struct SinkState {
    promoted: bool,
    deferred: Vec<StateMarker>,
}

impl OutputSink {
    pub fn direct(real: Arc<Outputs>) -> Self {
        Self {
            real,
            side: None,
            inner: Mutex::new(SinkState {
                promoted: true,
                deferred: Vec::new(),
            }),
        }
    }

    pub fn raced(real: Arc<Outputs>, config: &VoiceChatConfig) -> Self {
        Self {
            real,
            side: Some(Outputs::new(config)),
            inner: Mutex::new(SinkState::default()),
        }
    }

    pub fn is_visible(&self) -> bool {
        self.inner.lock().promoted
    }

    /// Hand `marker` to `emit` if visible, else hold it for promotion
    pub fn mark(&self, marker: StateMarker, emit: impl FnOnce(StateMarker)) {
        let mut inner = self.inner.lock();
        if inner.promoted {
            emit(marker);
        } else {
            inner.deferred.push(marker);
        }
    }

    pub fn push_audio(&self, samples: Vec<f32>) {
        let inner = self.inner.lock();
        match &self.side {
            Some(side) if !inner.promoted => side.audio.push(samples),
            _ => self.real.audio.push(samples),
        };
    }

    pub fn push_text(&self, text: String) {
        let inner = self.inner.lock();
        match &self.side {
            Some(side) if !inner.promoted => side.text.push(text),
            _ => self.real.text.push(text),
        };
    }

    /// Flush the side buffer into the real queues and replay held markers
    /// through `emit`, in order. Returns the number of audio chunks moved.
    pub fn promote(&self, mut emit: impl FnMut(StateMarker)) -> usize {
        let mut inner = self.inner.lock();
        if inner.promoted {
            return 0;
        }
        inner.promoted = true;
        for marker in inner.deferred.drain(..) {
            emit(marker);
        }
        let Some(side) = &self.side else {
            return 0;
        };
        let audio = side.audio.drain();
        let moved = audio.len();
        for chunk in audio {
            self.real.audio.push(chunk);
        }
        for text in side.text.drain() {
            self.real.text.push(text);
        }
        moved
    }

    /// Throw away everything buffered so far
    pub fn discard(&self) {
        self.inner.lock().deferred.clear();
        if let Some(side) = &self.side {
            side.clear();
        }
    }
}

pub struct ModelCaller {
    backend: Arc<dyn OmniBackend>,
    params: SessionParams,
    state: SharedState,
    outputs: Arc<Outputs>,
    outbound: OutboundSender,
    lease: Option<Lease>,
    cancel: CancellationToken,
    active: Mutex<Option<CancellationToken>>,
}

impl ModelCaller {
    pub fn new(
        backend: Arc<dyn OmniBackend>,
        params: SessionParams,
        state: SharedState,
        outputs: Arc<Outputs>,
        outbound: OutboundSender,
        lease: Option<Lease>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            params,
            state,
            outputs,
            outbound,
            lease,
            cancel,
            active: Mutex::new(None),
        }
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn outputs(&self) -> &Arc<Outputs> {
        &self.outputs
    }

    pub fn emit(&self, marker: StateMarker) {
        self.send(Outbound::Text(marker.as_str().to_string()));
    }

    pub fn send(&self, message: Outbound) {
        if !self.outbound.send(message) && self.outbound.frames.is_closed() {
            debug!("front end connection is gone");
        }
    }

    /// Make a raced generate's output visible
    pub fn promote(&self, sink: &OutputSink) -> usize {
        sink.promote(|marker| self.emit(marker))
    }

    pub async fn init(&self) -> Result<InitResponse> {
        let request = InitRequest {
            media_type: Some("omni".to_string()),
            duplex_mode: Some(self.params.is_duplex()),
            high_quality_mode: self.params.high_quality,
            high_fps_mode: self.params.high_fps,
            language: self.params.language.clone(),
        };
        match self.backend.init(&request).await {
            Ok(response) if response.success => {
                self.state.lock().model_ready = true;
                info!(backend_session = %response.session_id, "model initialized");
                self.emit(StateMarker::ModelInitSuccess);
                Ok(response)
            }
            Ok(response) => {
                self.emit(StateMarker::ModelInitFailed);
                Err(ParleyError::SessionError(response.message))
            }
            Err(e) => {
                self.emit(StateMarker::ModelInitFailed);
                Err(e)
            }
        }
    }

    /// Send one audio chunk at the transport rate. Returns false when the
    /// chunk was dropped because simplex playback is still running.
    pub async fn prefill_audio(&self, samples: &[f32], last_chunk: bool) -> Result<bool> {
        let image_audio_id = {
            let mut state = self.state.lock();
            if !self.params.is_duplex() && state.playback_active() {
                return Ok(false);
            }
            state.consume_audio()
        };

        let audio = resample_audio(samples, TRANSPORT_SAMPLE_RATE, MODEL_SAMPLE_RATE)?;
        let request = PrefillRequest {
            audio: Some(encode_wav_base64(&audio, MODEL_SAMPLE_RATE)?),
            image_audio_id: Some(image_audio_id),
            is_last_chunk: last_chunk,
            ..Default::default()
        };
        let response = self.backend.prefill(&request).await?;
        debug!(image_audio_id, last_chunk, cnt = ?response.cnt, samples = samples.len(), "audio prefilled");
        Ok(true)
    }

    /// Send one camera frame (JPEG). Returns false when throttled.
    pub async fn prefill_image(&self, jpeg: &[u8]) -> Result<bool> {
        let (image_audio_id, frame_index) = {
            let mut state = self.state.lock();
            if !self.params.is_duplex() && state.playback_active() {
                return Ok(false);
            }
            match state.admit_image(self.params.max_images_per_pair()) {
                Some(slot) => slot,
                None => return Ok(false),
            }
        };

        let request = PrefillRequest {
            image: Some(BASE64.encode(jpeg)),
            image_audio_id: Some(image_audio_id),
            frame_index: Some(frame_index),
            max_slice_nums: (self.params.high_quality && frame_index == 0).then_some(2),
            ..Default::default()
        };
        self.backend.prefill(&request).await?;
        debug!(image_audio_id, frame_index, "image prefilled");
        Ok(true)
    }

    /// Run one generate call to completion, writing into `sink`
    pub async fn generate(&self, sink: Arc<OutputSink>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !self.params.is_duplex() && state.generating {
                debug!("generate already running");
                return Ok(());
            }
            state.start_generate();
        }
        let token = self.cancel.child_token();
        *self.active.lock() = Some(token.clone());

        sink.mark(StateMarker::GenerateStart, |m| self.emit(m));
        if let Some(lease) = &self.lease {
            lease.renew().await;
        }

        let mut events = match self.backend.generate().await {
            Ok(events) => events,
            Err(e) => {
                self.finish(false, false);
                return Err(e);
            }
        };

        let mut chunks = 0u64;
        let mut completed = false;
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => {
                    debug!("generate cancelled");
                    break;
                }
                event = events.next() => event,
            };
            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!("generate stream failed: {}", e);
                    break;
                }
                None => {
                    completed = true;
                    break;
                }
            };

            if let Some(data) = event.chunk_data {
                match decode_chunk(&data) {
                    Ok(samples) => {
                        if chunks == 0 {
                            sink.mark(StateMarker::GenerateFirstChunk, |m| self.emit(m));
                        }
                        chunks += 1;
                        sink.push_audio(samples);
                    }
                    Err(e) => warn!(chunk_idx = ?event.chunk_idx, "dropping undecodable chunk: {}", e),
                }
                if let Some(text) = data.text.filter(|t| !t.is_empty()) {
                    sink.push_text(text);
                }
            }
            if let Some(error) = event.error {
                warn!("backend reported: {}", error);
                break;
            }
            if event.interrupted {
                debug!("generate interrupted");
                break;
            }
            if event.done {
                completed = true;
                break;
            }
        }

        self.finish(completed, chunks > 0);
        sink.mark(StateMarker::GenerateEnd, |m| self.emit(m));
        info!(chunks, completed, "generate finished");
        Ok(())
    }

    fn finish(&self, completed: bool, produced_audio: bool) {
        let mut state = self.state.lock();
        state.finish_generate(completed);
        if !produced_audio {
            // Nothing will be played, so no play_end is coming
            state.play_end = true;
        }
        *self.active.lock() = None;
    }

    /// Cancel the generate call in flight on this side only
    pub fn abort_active(&self) {
        if let Some(token) = self.active.lock().take() {
            token.cancel();
        }
    }

    /// User or barge-in break of the current round
    pub async fn break_generation(&self) {
        let generating = self.state.lock().generating;
        self.abort_active();
        if generating {
            if let Err(e) = self.backend.break_generation().await {
                warn!("backend break failed: {}", e);
            }
        }
        {
            let mut state = self.state.lock();
            state.play_end = true;
            state.generating = false;
            state.round += 1;
        }
        self.outputs.clear();
        self.emit(StateMarker::SessionBreak);
        info!("round broken");
    }

    /// Drop a raced generate whose turn turned out not to be over
    pub async fn abort_race(&self, sink: &OutputSink) {
        self.abort_active();
        sink.discard();
        if let Err(e) = self.backend.break_generation().await {
            warn!("backend break after race abort failed: {}", e);
        }
        let mut state = self.state.lock();
        state.generating = false;
        state.play_end = true;
    }

    /// Stop the backend session and give the service back
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.abort_active();
        if let Err(e) = self.backend.stop().await {
            warn!("backend stop failed: {}", e);
        }
        if let Some(lease) = &self.lease {
            lease.release().await;
        }
    }
}

/// PCM16 chunk at its own rate -> f32 at the transport rate
fn decode_chunk(data: &ChunkData) -> Result<Vec<f32>> {
    let bytes = BASE64
        .decode(data.wav.trim())
        .map_err(|e| ParleyError::AudioProcessingError(format!("Invalid base64 chunk: {}", e)))?;
    let samples = i16_to_f32(&pcm16_from_le_bytes(&bytes));
    if data.sample_rate == TRANSPORT_SAMPLE_RATE || samples.is_empty() {
        return Ok(samples);
    }
    resample_audio(&samples, data.sample_rate, TRANSPORT_SAMPLE_RATE)
}

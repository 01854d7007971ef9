//! Prefill/generate protocol driver
//!
//! Owns the per-session state of one worker and turns `streaming_prefill`
//! and `streaming_generate` requests into engine calls:
//!
//! - duplex: every prefill goes to the engine immediately
//! - high-fps omni: direct as well, sub-frames are cached per pairing id and
//!   composited before they go out with their audio
//! - simplex: "delay one beat", each prefill flushes the previously cached
//!   unit and caches the current one; generate flushes the last unit

use super::compose::{decode_image_base64, save_png, stack_images};
use super::engine::{
    DecodeRequest, EnginePrefill, OmniInit, SessionConfigUpdate, StreamEngine, MEDIA_AUDIO, MEDIA_OMNI,
};
use super::multiplex::{duplex_events, simplex_events, DuplexCursor, ScanTiming};
use crate::audio::wav::{decode_wav_base64, write_wav};
use crate::audio::{pad_to_min, resample_audio, MIN_PREFILL_SAMPLES, MODEL_SAMPLE_RATE};
use crate::config::WorkerConfig;
use crate::protocol::{GenerateEvent, InitRequest, InitResponse, PrefillRequest, PrefillResponse};
use crate::{ParleyError, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use image::RgbImage;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Sub-frame slots of one pairing id
const SUBFRAME_SLOTS: [u32; 4] = [1, 2, 3, 4];

/// How a prefill is sent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrefillRoute {
    Duplex,
    HighFpsDirect,
    DelayOneBeat,
}

/// Audio and images waiting for the next simplex prefill or generate
#[derive(Clone)]
pub struct PendingUnit {
    pub cnt: u64,
    pub audio: Option<Vec<f32>>,
    pub images: Vec<RgbImage>,
}

/// Mutable state of the active session
pub struct DriverState {
    /// The engine context exists (`omni_init` succeeded)
    pub engine_ready: bool,
    pub session_id: Option<String>,
    pub media_type: u8,
    pub duplex: bool,
    pub high_quality: bool,
    pub high_fps: bool,
    pub language: String,
    /// Engine `cnt` of the next call in this round
    pub counter: u64,
    pub round: u32,
    pending: Option<PendingUnit>,
    subframes: BTreeMap<u64, BTreeMap<u32, RgbImage>>,
    held_audio: BTreeMap<u64, Vec<f32>>,
}

impl DriverState {
    fn new(duplex: bool) -> Self {
        Self {
            engine_ready: false,
            session_id: None,
            media_type: MEDIA_OMNI,
            duplex,
            high_quality: false,
            high_fps: false,
            language: "zh".to_string(),
            counter: 0,
            round: 0,
            pending: None,
            subframes: BTreeMap::new(),
            held_audio: BTreeMap::new(),
        }
    }

    fn clear_session(&mut self) {
        self.counter = 0;
        self.round = 0;
        self.pending = None;
        self.subframes.clear();
        self.held_audio.clear();
    }

    pub fn route(&self) -> PrefillRoute {
        if self.duplex {
            PrefillRoute::Duplex
        } else if self.high_fps && self.media_type == MEDIA_OMNI {
            PrefillRoute::HighFpsDirect
        } else {
            PrefillRoute::DelayOneBeat
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// Images of one engine call sequence, with their file name suffix
struct ImagePlan {
    parts: Vec<(String, RgbImage)>,
    max_slice_nums: Option<u32>,
}

impl ImagePlan {
    fn none() -> Self {
        Self {
            parts: Vec::new(),
            max_slice_nums: None,
        }
    }

    /// Engine calls this plan needs
    fn calls(&self) -> u64 {
        self.parts.len().max(1) as u64
    }
}

pub struct Driver {
    engine: Arc<dyn StreamEngine>,
    config: WorkerConfig,
    state: Mutex<DriverState>,
    duplex_cursor: Arc<parking_lot::Mutex<DuplexCursor>>,
    breaking: Arc<AtomicBool>,
    restarting: AtomicBool,
}

impl Driver {
    pub fn new(engine: Arc<dyn StreamEngine>, config: WorkerConfig) -> Self {
        let duplex = config.duplex;
        Self {
            engine,
            config,
            state: Mutex::new(DriverState::new(duplex)),
            duplex_cursor: Arc::new(parking_lot::Mutex::new(DuplexCursor::default())),
            breaking: Arc::new(AtomicBool::new(false)),
            restarting: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn StreamEngine> {
        &self.engine
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    pub fn set_restarting(&self, restarting: bool) {
        self.restarting.store(restarting, Ordering::SeqCst);
    }

    pub fn is_breaking(&self) -> bool {
        self.breaking.load(Ordering::SeqCst)
    }

    pub async fn duplex_mode(&self) -> bool {
        self.state.lock().await.duplex
    }

    pub async fn session_id(&self) -> Option<String> {
        self.state.lock().await.session_id.clone()
    }

    pub async fn round(&self) -> u32 {
        self.state.lock().await.round
    }

    pub async fn counter(&self) -> u64 {
        self.state.lock().await.counter
    }

    pub async fn has_pending(&self) -> bool {
        self.state.lock().await.has_pending()
    }

    pub async fn engine_ready(&self) -> bool {
        self.state.lock().await.engine_ready
    }

    /// Start (or resume) a session
    pub async fn init_session(&self, request: InitRequest) -> Result<InitResponse> {
        if self.breaking.swap(false, Ordering::SeqCst) {
            debug!("cleared leftover break flag");
        }
        if self.is_restarting() {
            return Err(ParleyError::EngineRestarting);
        }

        let media_type = match request.media_type.as_deref().map(str::to_lowercase) {
            None => MEDIA_OMNI,
            Some(t) if t == "audio" => MEDIA_AUDIO,
            Some(t) if t == "video" || t == "omni" => MEDIA_OMNI,
            Some(other) => {
                return Err(ParleyError::ProtocolError(format!(
                    "Unsupported media_type: {}",
                    other
                )))
            }
        };
        let language = request.language.unwrap_or_else(|| "zh".to_string());

        clear_output_subfolders(&self.config.output_dir);

        let mut state = self.state.lock().await;
        let mut duplex = request.duplex_mode.unwrap_or(self.config.duplex);
        if state.engine_ready && duplex != state.duplex {
            warn!(
                current = state.duplex,
                requested = duplex,
                "duplex mode is fixed once initialized, ignoring request"
            );
            duplex = state.duplex;
        }

        let fast_resume = state.engine_ready && state.media_type == media_type;
        if !state.engine_ready {
            let init = self.omni_init_request(media_type, duplex, &language, request.high_quality_mode);
            self.engine.omni_init(&init).await?;
            state.engine_ready = true;
        } else {
            self.engine
                .update_session_config(&SessionConfigUpdate {
                    media_type,
                    duplex_mode: duplex,
                    language: language.clone(),
                })
                .await?;
        }

        let session_id: String = uuid::Uuid::new_v4().to_string().chars().take(8).collect();
        state.media_type = media_type;
        state.duplex = duplex;
        state.high_quality = request.high_quality_mode;
        state.high_fps = request.high_fps_mode;
        state.language = language;
        state.session_id = Some(session_id.clone());
        state.clear_session();
        *self.duplex_cursor.lock() = DuplexCursor::default();

        info!(
            session_id = %session_id,
            media_type,
            duplex,
            high_quality = state.high_quality,
            high_fps = state.high_fps,
            fast_resume,
            "session initialized"
        );

        Ok(InitResponse {
            success: true,
            message: "System prompt initialized".to_string(),
            msg_type: media_type,
            duplex_mode: duplex,
            session_id,
            fast_resume,
        })
    }

    fn omni_init_request(&self, media_type: u8, duplex: bool, language: &str, high_quality: bool) -> OmniInit {
        let model_dir = self.config.model_dir.to_string_lossy().to_string();
        OmniInit {
            media_type,
            use_tts: true,
            duplex_mode: duplex,
            tts_bin_dir: self.config.model_dir.join("tts").to_string_lossy().to_string(),
            model_dir,
            output_dir: self.config.output_dir.to_string_lossy().to_string(),
            language: language.to_string(),
            max_slice_nums: high_quality.then_some(2),
        }
    }

    /// Re-create the engine context after a process restart
    pub async fn reinitialize_engine(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let init = self.omni_init_request(state.media_type, state.duplex, &state.language.clone(), state.high_quality);
        self.engine.omni_init(&init).await?;
        state.engine_ready = true;
        Ok(())
    }

    /// Forget the session and the engine context, before a restart
    pub async fn reset_for_restart(&self) {
        let mut state = self.state.lock().await;
        state.engine_ready = false;
        state.session_id = None;
        state.clear_session();
        *self.duplex_cursor.lock() = DuplexCursor::default();
    }

    pub async fn prefill(&self, request: PrefillRequest) -> Result<PrefillResponse> {
        if self.is_restarting() {
            return Err(ParleyError::EngineRestarting);
        }

        let audio = match request.audio.as_deref() {
            Some(data) if !data.is_empty() => Some(decode_audio(data)?),
            _ => None,
        };
        let image = match request.image.as_deref() {
            Some(data) if !data.is_empty() => Some(decode_image_base64(data)?),
            _ => None,
        };

        let mut state = self.state.lock().await;
        let session_id = state.session_id.clone().ok_or_else(|| {
            ParleyError::SessionError("No active session, call init_sys_prompt first".into())
        })?;

        let mut audio = audio;
        let mut images: Vec<RgbImage> = image.iter().cloned().collect();
        let mut is_main_image = false;

        if state.high_fps {
            if let Some(pair_id) = request.image_audio_id {
                let frame_index = request.frame_index.unwrap_or(0);
                match (audio.take(), image) {
                    (None, Some(frame)) if frame_index == 0 => {
                        is_main_image = true;
                        images = vec![frame];
                    }
                    (None, Some(frame)) => {
                        let frames = state.subframes.entry(pair_id).or_default();
                        frames.insert(frame_index, frame);
                        let cached = frames.len();
                        let complete = SUBFRAME_SLOTS.iter().all(|i| frames.contains_key(i));
                        let held = if complete { state.held_audio.remove(&pair_id) } else { None };
                        match held {
                            Some(held) => {
                                audio = Some(held);
                                images = vec![take_composite(&mut state, pair_id)?];
                            }
                            None => {
                                debug!(pair_id, frame_index, cached, "sub-frame cached");
                                return Ok(PrefillResponse {
                                    success: true,
                                    message: format!("Sub-frame cached ({} of {})", cached, SUBFRAME_SLOTS.len()),
                                    cnt: None,
                                });
                            }
                        }
                    }
                    (Some(samples), frame) => {
                        self.release_stale_audio(&mut state, &session_id, pair_id).await?;
                        if state.subframes.get(&pair_id).map(|f| !f.is_empty()).unwrap_or(false) {
                            audio = Some(samples);
                            images = vec![take_composite(&mut state, pair_id)?];
                            images.extend(frame);
                        } else {
                            debug!(pair_id, "audio held until sub-frames arrive");
                            state.held_audio.insert(pair_id, samples);
                            return Ok(PrefillResponse {
                                success: true,
                                message: "Audio held until sub-frames arrive".to_string(),
                                cnt: None,
                            });
                        }
                    }
                    (None, None) => {}
                }
            }
        }

        if audio.is_none() && images.is_empty() {
            return Err(ParleyError::ProtocolError(
                "Either audio or image is required".into(),
            ));
        }

        match state.route() {
            PrefillRoute::Duplex => {
                let plan = self.plan_images(&state, images, false);
                let cnt = state.counter;
                state.counter += plan.calls();
                drop(state);
                self.send_unit(&session_id, cnt, audio.as_deref(), plan, false).await?;
                Ok(PrefillResponse {
                    success: true,
                    message: "Prefill forwarded".to_string(),
                    cnt: Some(cnt),
                })
            }
            PrefillRoute::HighFpsDirect => {
                let slice = if is_main_image && state.high_quality { 2 } else { 1 };
                let plan = ImagePlan {
                    parts: images
                        .into_iter()
                        .enumerate()
                        .map(|(i, img)| (i.to_string(), img))
                        .collect(),
                    max_slice_nums: Some(slice),
                };
                let cnt = state.counter;
                state.counter += plan.calls();
                drop(state);
                self.send_unit(&session_id, cnt, audio.as_deref(), plan, false).await?;
                Ok(PrefillResponse {
                    success: true,
                    message: "Prefill forwarded".to_string(),
                    cnt: Some(cnt),
                })
            }
            PrefillRoute::DelayOneBeat => {
                // Engine calls stay ordered because the state lock is held
                // across the flush
                if let Some(previous) = state.pending.take() {
                    let plan = self.plan_images(&state, previous.images, true);
                    if let Err(e) = self
                        .send_unit(&session_id, previous.cnt, previous.audio.as_deref(), plan, false)
                        .await
                    {
                        warn!(cnt = previous.cnt, "flushing cached unit failed: {}", e);
                    }
                }

                let calls = self.plan_calls(&state, &images);
                let cnt = state.counter;
                state.counter += calls;
                state.pending = Some(PendingUnit { cnt, audio, images });
                debug!(cnt, "unit cached");
                Ok(PrefillResponse {
                    success: true,
                    message: "Prefill cached".to_string(),
                    cnt: Some(cnt),
                })
            }
        }
    }

    /// High-fps audio still waiting on sub-frames when newer audio arrives
    /// goes out on its own
    async fn release_stale_audio(
        &self,
        state: &mut DriverState,
        session_id: &str,
        pair_id: u64,
    ) -> Result<()> {
        let stale: Vec<u64> = state.held_audio.range(..pair_id).map(|(id, _)| *id).collect();
        for id in stale {
            if let Some(samples) = state.held_audio.remove(&id) {
                state.subframes.remove(&id);
                let cnt = state.counter;
                state.counter += 1;
                debug!(pair_id = id, cnt, "releasing held audio without sub-frames");
                self.send_unit(session_id, cnt, Some(&samples), ImagePlan::none(), false)
                    .await?;
            }
        }
        Ok(())
    }

    fn plan_images(&self, state: &DriverState, images: Vec<RgbImage>, keep_all: bool) -> ImagePlan {
        if images.is_empty() {
            return ImagePlan::none();
        }
        if state.high_fps && images.len() > 1 {
            let mut iter = images.into_iter();
            let mut parts = Vec::with_capacity(2);
            if let Some(main) = iter.next() {
                parts.push(("main".to_string(), main));
            }
            let rest: Vec<RgbImage> = iter.collect();
            match stack_images(&rest) {
                Ok(stacked) => parts.push(("stack".to_string(), stacked)),
                Err(e) => warn!("stacking sub-frames failed: {}", e),
            }
            return ImagePlan {
                parts,
                max_slice_nums: None,
            };
        }
        let parts = if keep_all {
            images
                .into_iter()
                .enumerate()
                .map(|(i, img)| (i.to_string(), img))
                .collect()
        } else {
            images.into_iter().take(1).map(|img| (String::new(), img)).collect()
        };
        ImagePlan {
            parts,
            max_slice_nums: None,
        }
    }

    fn plan_calls(&self, state: &DriverState, images: &[RgbImage]) -> u64 {
        if state.high_fps && images.len() > 1 {
            2
        } else {
            images.len().max(1) as u64
        }
    }

    /// Write the unit to temp files and issue its engine calls: the audio
    /// rides on the first call, each image gets its own `cnt`. With `last`
    /// set the unit's final call closes the turn.
    async fn send_unit(
        &self,
        session_id: &str,
        cnt: u64,
        audio: Option<&[f32]>,
        plan: ImagePlan,
        last: bool,
    ) -> Result<()> {
        let temp_dir = &self.config.temp_dir;
        std::fs::create_dir_all(temp_dir)?;
        let mut written: Vec<PathBuf> = Vec::new();

        let result = async {
            let mut audio_path = String::new();
            if let Some(samples) = audio.filter(|s| !s.is_empty()) {
                let padded = pad_to_min(samples.to_vec(), MIN_PREFILL_SAMPLES);
                let path = temp_dir.join(format!("prefill_{}_{}.wav", session_id, cnt));
                write_wav(&path, &padded, MODEL_SAMPLE_RATE)?;
                audio_path = path.to_string_lossy().to_string();
                written.push(path);
            }

            let mut image_paths = Vec::with_capacity(plan.parts.len());
            for (suffix, image) in &plan.parts {
                let name = if suffix.is_empty() {
                    format!("prefill_{}_{}.png", session_id, cnt)
                } else {
                    format!("prefill_{}_{}_{}.png", session_id, cnt, suffix)
                };
                let path = temp_dir.join(name);
                save_png(image, &path)?;
                image_paths.push(path.to_string_lossy().to_string());
                written.push(path);
            }

            if image_paths.is_empty() {
                self.engine
                    .prefill(&EnginePrefill {
                        audio_path_prefix: audio_path,
                        img_path_prefix: String::new(),
                        cnt,
                        is_last_chunk: last,
                        max_slice_nums: None,
                    })
                    .await?;
            } else {
                let calls = image_paths.len();
                for (i, img_path) in image_paths.into_iter().enumerate() {
                    self.engine
                        .prefill(&EnginePrefill {
                            audio_path_prefix: if i == 0 { audio_path.clone() } else { String::new() },
                            img_path_prefix: img_path,
                            cnt: cnt + i as u64,
                            is_last_chunk: last && i + 1 == calls,
                            max_slice_nums: plan.max_slice_nums,
                        })
                        .await?;
                }
            }
            debug!(cnt, images = plan.parts.len(), audio = audio.is_some(), last, "prefill sent");
            Ok::<(), ParleyError>(())
        }
        .await;

        for path in written {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("could not remove {}: {}", path.display(), e);
            }
        }
        result
    }

    /// Flush what is still cached and start decoding. The stream ends with
    /// exactly one terminal event; round and counter advance before it is
    /// delivered.
    pub async fn generate(self: &Arc<Self>) -> Result<BoxStream<'static, GenerateEvent>> {
        if self.is_restarting() {
            return Err(ParleyError::EngineRestarting);
        }
        self.breaking.store(false, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        let session_id = state.session_id.clone().ok_or_else(|| {
            ParleyError::SessionError("No active session, call init_sys_prompt first".into())
        })?;
        let round = state.round;
        let duplex = state.duplex;

        if !duplex {
            let held: Vec<(u64, Vec<f32>)> = std::mem::take(&mut state.held_audio).into_iter().collect();
            let closes_turn = state.pending.is_none();
            let held_count = held.len();
            for (i, (pair_id, samples)) in held.into_iter().enumerate() {
                let cnt = state.counter;
                state.counter += 1;
                let last = closes_turn && i + 1 == held_count;
                debug!(pair_id, cnt, last, "flushing held audio before generate");
                if let Err(e) = self
                    .send_unit(&session_id, cnt, Some(&samples), ImagePlan::none(), last)
                    .await
                {
                    warn!(cnt, "flushing held audio failed: {}", e);
                }
            }
            for (pair_id, frames) in std::mem::take(&mut state.subframes) {
                if !frames.is_empty() {
                    debug!(pair_id, frames = frames.len(), "dropping incomplete sub-frame set");
                }
            }

            if let Some(last) = state.pending.take() {
                let plan = self.plan_images(&state, last.images, true);
                if let Err(e) = self
                    .send_unit(&session_id, last.cnt, last.audio.as_deref(), plan, true)
                    .await
                {
                    warn!(cnt = last.cnt, "final prefill failed: {}", e);
                }
            }
        }
        drop(state);

        info!(session_id = %session_id, round, duplex, "generate started");
        let events = if duplex {
            duplex_events(
                self.engine.clone(),
                DecodeRequest {
                    debug_dir: self.config.output_dir.to_string_lossy().to_string(),
                    stream: true,
                    round_idx: None,
                },
                self.config.output_dir.clone(),
                self.duplex_cursor.clone(),
                ScanTiming::duplex(
                    self.config.duplex_poll_ms,
                    self.config.duplex_final_wait_ms,
                    self.config.duplex_final_idle_polls,
                ),
                self.breaking.clone(),
            )
            .boxed()
        } else {
            simplex_events(
                self.engine.clone(),
                DecodeRequest {
                    debug_dir: self.config.output_dir.to_string_lossy().to_string(),
                    stream: true,
                    round_idx: Some(round),
                },
                round_dir(&self.config.output_dir, round),
                ScanTiming::simplex(self.config.simplex_poll_ms, self.config.simplex_idle_polls),
                self.breaking.clone(),
            )
            .boxed()
        };

        let driver = self.clone();
        Ok(async_stream::stream! {
            let mut events = events;
            let mut finished = false;
            while let Some(event) = events.next().await {
                if event.is_terminal() {
                    driver.finish_round().await;
                    finished = true;
                    yield event;
                    break;
                }
                yield event;
            }
            if !finished {
                driver.finish_round().await;
                yield GenerateEvent::done();
            }
        }
        .boxed())
    }

    async fn finish_round(&self) {
        let mut state = self.state.lock().await;
        state.round += 1;
        state.counter = 0;
        debug!(round = state.round, "round advanced");
    }

    /// Abort the current generation, keep the session
    pub async fn break_generation(&self) -> Result<()> {
        if !self.engine_ready().await {
            return Err(ParleyError::EngineRestarting);
        }
        self.breaking.store(true, Ordering::SeqCst);
        if let Err(e) = self.engine.break_generation().await {
            warn!("engine break failed: {}", e);
        }
        info!("generation break requested");
        Ok(())
    }

    /// Abort and forget the session; the engine context is kept
    pub async fn stop(&self) -> Option<String> {
        if let Err(e) = self.engine.break_generation().await {
            debug!("engine break during stop failed: {}", e);
        }
        self.breaking.store(true, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        let previous = state.session_id.take();
        state.clear_session();
        *self.duplex_cursor.lock() = DuplexCursor::default();
        info!(session_id = ?previous, "session stopped");
        previous
    }
}

/// `<output>/round_<nnn>`
pub fn round_dir(output_dir: &Path, round: u32) -> PathBuf {
    output_dir.join(format!("round_{:03}", round))
}

fn decode_audio(data: &str) -> Result<Vec<f32>> {
    let (samples, rate) = decode_wav_base64(data)?;
    if rate == MODEL_SAMPLE_RATE {
        Ok(samples)
    } else {
        resample_audio(&samples, rate, MODEL_SAMPLE_RATE)
    }
}

fn take_composite(state: &mut DriverState, pair_id: u64) -> Result<RgbImage> {
    let frames: Vec<RgbImage> = state
        .subframes
        .remove(&pair_id)
        .unwrap_or_default()
        .into_values()
        .collect();
    debug!(pair_id, frames = frames.len(), "compositing sub-frames");
    stack_images(&frames)
}

/// Empty every first-level folder of the engine output directory, keeping
/// the folders themselves
pub fn clear_output_subfolders(output_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(output_dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(children) = std::fs::read_dir(&path) else {
            continue;
        };
        for child in children.filter_map(|e| e.ok()) {
            let child = child.path();
            let result = if child.is_dir() {
                std::fs::remove_dir_all(&child)
            } else {
                std::fs::remove_file(&child)
            };
            if let Err(e) = result {
                warn!("failed to clear {}: {}", child.display(), e);
            }
        }
    }
}

/// `rm -rf` and recreate the output directory
pub fn reset_output_dir(output_dir: &Path) -> Result<()> {
    if output_dir.exists() {
        std::fs::remove_dir_all(output_dir)?;
    }
    std::fs::create_dir_all(output_dir)?;
    Ok(())
}

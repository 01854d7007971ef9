//! Session loops: audio ingest, turn taking and paced output

use super::model::{ModelCaller, Outbound, OutputSink, StateMarker};
use super::queue::DropOldestQueue;
use super::state::SharedState;
use crate::audio::{f32_to_i16, AudioRingBuffer, FrameSlicer, FRAME_SAMPLES, TRANSPORT_SAMPLE_RATE};
use crate::config::VoiceChatConfig;
use crate::vad::{TurnDetector, TurnParams, VadPool};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Decision tick of the turn loop
pub const TICK: Duration = Duration::from_millis(100);
/// One prefill batch, one second at the transport rate
pub const BATCH_SAMPLES: usize = TRANSPORT_SAMPLE_RATE as usize;
/// A tail shorter than 50 ms is not worth a prefill
pub const MIN_TAIL_SAMPLES: usize = (TRANSPORT_SAMPLE_RATE / 20) as usize;
/// Audio captured longer ago than this is dropped on ingest
pub const MAX_FRAME_AGE_MS: u64 = 2000;
/// Queue idle time before the last partial frame is flushed
const FLUSH_IDLE: Duration = Duration::from_millis(200);
const FRAME_PERIOD: Duration = Duration::from_millis(20);

/// Microphone audio from the front end
#[derive(Clone, Debug)]
pub struct AudioFrame {
    /// Capture time, milliseconds since the Unix epoch
    pub captured_at_ms: u64,
    /// Mono samples at the transport rate
    pub samples: Vec<f32>,
}

/// Queue an inbound frame unless the session is not listening yet or the
/// frame is stale
pub fn ingest_audio(
    state: &SharedState,
    input: &DropOldestQueue<Vec<f32>>,
    frame: AudioFrame,
    now_ms: u64,
) -> bool {
    if !state.lock().accepting_audio {
        return false;
    }
    if now_ms.saturating_sub(frame.captured_at_ms) > MAX_FRAME_AGE_MS {
        debug!(age_ms = now_ms.saturating_sub(frame.captured_at_ms), "dropping stale audio frame");
        return false;
    }
    let dropped = input.push(frame.samples);
    if dropped > 0 {
        warn!(dropped, "audio input queue overflow");
    }
    true
}

/// A generate call running ahead of confirmed silence
struct Race {
    sink: Arc<OutputSink>,
    task: JoinHandle<()>,
}

pub struct TurnLoop {
    model: Arc<ModelCaller>,
    vad: Arc<VadPool>,
    config: VoiceChatConfig,
    input: Arc<DropOldestQueue<Vec<f32>>>,
    pending: Vec<f32>,
    generate_task: Option<JoinHandle<()>>,
}

impl TurnLoop {
    pub fn new(
        model: Arc<ModelCaller>,
        vad: Arc<VadPool>,
        config: VoiceChatConfig,
        input: Arc<DropOldestQueue<Vec<f32>>>,
    ) -> Self {
        Self {
            model,
            vad,
            config,
            input,
            pending: Vec::new(),
            generate_task: None,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        if self.model.params().is_duplex() {
            self.run_duplex(cancel).await
        } else {
            self.run_simplex(cancel).await
        }
    }

    fn turn_params(&self) -> TurnParams {
        let params = self.model.params();
        TurnParams {
            onset: self.config.vad_onset,
            offset: params.vad_offset,
            hold: Duration::from_millis(self.config.vad_hold_ms),
            tail_threshold: params.vad_offset,
            race_debounce: self.config.race_debounce,
        }
    }

    /// Move freshly ingested audio into the window and the prefill buffer
    fn absorb_input(&mut self, ring: Option<&mut AudioRingBuffer>) -> bool {
        let fresh = self.input.drain();
        if fresh.is_empty() {
            return false;
        }
        let mut ring = ring;
        for samples in fresh {
            if let Some(ring) = ring.as_deref_mut() {
                ring.push_slice(&samples);
            }
            self.pending.extend_from_slice(&samples);
        }
        true
    }

    /// Prefill every whole second in the buffer, keeping the remainder
    async fn prefill_batches(&mut self) -> usize {
        let mut sent = 0;
        while self.pending.len() >= BATCH_SAMPLES {
            let batch: Vec<f32> = self.pending.drain(..BATCH_SAMPLES).collect();
            match self.model.prefill_audio(&batch, false).await {
                Ok(true) => sent += 1,
                Ok(false) => debug!("batch dropped during playback"),
                Err(e) => warn!("audio prefill failed: {}", e),
            }
        }
        sent
    }

    async fn prefill_tail(&mut self) {
        let tail = std::mem::take(&mut self.pending);
        if tail.len() <= MIN_TAIL_SAMPLES {
            return;
        }
        if let Err(e) = self.model.prefill_audio(&tail, true).await {
            warn!("final audio prefill failed: {}", e);
        }
    }

    fn spawn_generate(&self, sink: Arc<OutputSink>) -> JoinHandle<()> {
        let model = self.model.clone();
        tokio::spawn(
            async move {
                if let Err(e) = model.generate(sink).await {
                    warn!("generate failed: {}", e);
                }
            }
            .in_current_span(),
        )
    }

    async fn run_simplex(mut self, cancel: CancellationToken) {
        let mut ring = AudioRingBuffer::new(BATCH_SAMPLES);
        let mut turn = TurnDetector::new(self.turn_params());
        let mut race: Option<Race> = None;
        let tail_seconds = self.model.params().vad_tail_seconds;
        let vad_race = self.model.params().vad_race;

        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("simplex turn loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.absorb_input(Some(&mut ring)) || !ring.is_full() {
                continue;
            }

            let score = match self
                .vad
                .score(ring.snapshot(), TRANSPORT_SAMPLE_RATE, tail_seconds)
                .await
            {
                Ok(score) => score,
                Err(e) => {
                    warn!("VAD scoring failed: {}", e);
                    continue;
                }
            };

            let playing = self.model.state().lock().playback_active();
            if playing && race.is_none() {
                if self.config.enable_voice_interruption
                    && score.full > self.config.voice_interruption_threshold
                {
                    info!(full = score.full, "barge-in");
                    self.model.break_generation().await;
                }
                // Nothing spoken over playback is prefilled
                self.pending.clear();
                turn.reset();
                continue;
            }

            let verdict = turn.observe(score, Instant::now());

            if turn.is_speaking() {
                self.prefill_batches().await;

                if vad_race && verdict.race_ready && race.is_none() {
                    debug!(tail = score.tail, "racing ahead of silence");
                    self.prefill_tail().await;
                    let sink = Arc::new(OutputSink::raced(self.model.outputs().clone(), &self.config));
                    let task = self.spawn_generate(sink.clone());
                    race = Some(Race { sink, task });
                } else if verdict.tail_speech {
                    if let Some(aborted) = race.take() {
                        info!("speech resumed, dropping raced output");
                        self.model.abort_race(&aborted.sink).await;
                        aborted.task.abort();
                    }
                }
            } else if verdict.speech_active {
                // Keep only the lead-in before an utterance starts
                if self.pending.len() > BATCH_SAMPLES {
                    let excess = self.pending.len() - BATCH_SAMPLES;
                    self.pending.drain(..excess);
                }
            }

            if !verdict.speech_active {
                self.model.emit(StateMarker::VadEnd);
                match race.take() {
                    Some(confirmed) => {
                        let moved = self.model.promote(&confirmed.sink);
                        info!(moved, "turn confirmed, releasing raced output");
                        self.generate_task = Some(confirmed.task);
                    }
                    None => {
                        self.prefill_tail().await;
                        let sink = Arc::new(OutputSink::direct(self.model.outputs().clone()));
                        self.generate_task = Some(self.spawn_generate(sink));
                    }
                }
                ring.clear();
                self.pending.clear();
                turn.reset();
            }
        }

        if let Some(race) = race {
            race.task.abort();
        }
        if let Some(task) = self.generate_task.take() {
            task.abort();
        }
        info!("simplex turn loop stopped");
    }

    async fn run_duplex(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("duplex loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.absorb_input(None) {
                continue;
            }
            if self.prefill_batches().await == 0 {
                continue;
            }
            let in_flight = self
                .generate_task
                .as_ref()
                .map(|task| !task.is_finished())
                .unwrap_or(false);
            if !in_flight {
                let sink = Arc::new(OutputSink::direct(self.model.outputs().clone()));
                self.generate_task = Some(self.spawn_generate(sink));
            }
        }

        if let Some(task) = self.generate_task.take() {
            task.abort();
        }
        info!("duplex loop stopped");
    }
}

/// Paces generated audio out as 20 ms frames and forwards text
pub async fn run_output(model: Arc<ModelCaller>, config: VoiceChatConfig, cancel: CancellationToken) {
    let duplex = model.params().is_duplex();
    let initial_delay = Duration::from_millis(config.duplex_initial_delay_ms);
    let mut slicer = FrameSlicer::new(FRAME_SAMPLES);
    let mut frames: VecDeque<Vec<f32>> = VecDeque::new();
    let mut idle = Duration::ZERO;
    let mut announced = false;

    let mut clock = tokio::time::interval(FRAME_PERIOD);
    clock.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = clock.tick() => {}
        }

        for text in model.outputs().text.drain() {
            model.send(Outbound::Text(json!({ "type": "text", "text": text }).to_string()));
        }

        let (generating, play_end, started) = {
            let state = model.state().lock();
            (state.generating, state.play_end, state.generate_started)
        };

        if play_end && !frames.is_empty() && !duplex {
            // A break landed while frames were queued
            frames.clear();
            slicer.clear();
        }

        if duplex && !announced {
            if let Some(started) = started {
                if started.elapsed() < initial_delay {
                    continue;
                }
            }
        }

        if frames.is_empty() {
            if let Some(chunk) = model.outputs().audio.pop() {
                frames.extend(slicer.push(&chunk));
            }
        }

        match frames.pop_front() {
            Some(frame) => {
                if !announced {
                    announced = true;
                    model.state().lock().speaking = true;
                    model.emit(StateMarker::AudioStart);
                }
                model.send(Outbound::Audio(f32_to_i16(&frame)));
                idle = Duration::ZERO;
            }
            None => {
                idle += FRAME_PERIOD;
                if idle >= FLUSH_IDLE && !generating {
                    if let Some(last) = slicer.flush() {
                        model.send(Outbound::Audio(f32_to_i16(&last)));
                    }
                    announced = false;
                }
            }
        }
    }
}

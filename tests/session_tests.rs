//! Gateway session loops driven against a scripted backend

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use parley::audio::{f32_to_i16, pcm16_to_le_bytes};
use parley::config::VoiceChatConfig;
use parley::pool::ModelType;
use parley::protocol::{ChunkData, GenerateEvent, InitRequest, InitResponse, PrefillRequest, PrefillResponse};
use parley::session::backend::EventStream;
use parley::session::state::shared_state;
use parley::session::stream::{run_output, TurnLoop};
use parley::session::{
    outbound_channel, DropOldestQueue, ModelCaller, OmniBackend, Outbound, OutboundReceiver, OutputSink, Outputs,
    SessionParams, StateMarker,
};
use parley::vad::{EnergyScorer, ScorerFactory, SpeechScorer, VadPool};
use parley::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Answers every generate with one 100 ms chunk and `done`
#[derive(Default)]
struct ScriptedBackend {
    prefills: Mutex<Vec<PrefillRequest>>,
    generates: AtomicUsize,
    breaks: AtomicUsize,
    stops: AtomicUsize,
}

#[async_trait]
impl OmniBackend for ScriptedBackend {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse> {
        Ok(InitResponse {
            success: true,
            message: "ok".to_string(),
            msg_type: 2,
            duplex_mode: request.duplex_mode.unwrap_or(false),
            session_id: "abcd1234".to_string(),
            fast_resume: false,
        })
    }

    async fn prefill(&self, request: &PrefillRequest) -> Result<PrefillResponse> {
        let mut prefills = self.prefills.lock();
        prefills.push(request.clone());
        Ok(PrefillResponse {
            success: true,
            message: "cached".to_string(),
            cnt: Some(prefills.len() as u64 - 1),
        })
    }

    async fn generate(&self) -> Result<EventStream> {
        self.generates.fetch_add(1, Ordering::SeqCst);
        let pcm = pcm16_to_le_bytes(&f32_to_i16(&vec![0.2; 2400]));
        let chunk = GenerateEvent::chunk(
            0,
            ChunkData {
                wav: STANDARD.encode(pcm),
                sample_rate: 24000,
                text: Some("hello".to_string()),
            },
        );
        Ok(stream::iter(vec![Ok(chunk), Ok(GenerateEvent::done())]).boxed())
    }

    async fn break_generation(&self) -> Result<()> {
        self.breaks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    backend: Arc<ScriptedBackend>,
    model: Arc<ModelCaller>,
    outbound: OutboundReceiver,
    cancel: CancellationToken,
}

fn harness(params: SessionParams, config: &VoiceChatConfig) -> Harness {
    let backend = Arc::new(ScriptedBackend::default());
    let (tx, outbound) = outbound_channel(config.outbound_frame_queue);
    let cancel = CancellationToken::new();
    let model = Arc::new(ModelCaller::new(
        backend.clone(),
        params.clone(),
        shared_state(params.high_fps),
        Arc::new(Outputs::new(config)),
        tx,
        None,
        cancel.clone(),
    ));
    Harness {
        backend,
        model,
        outbound,
        cancel,
    }
}

fn energy_pool() -> Arc<VadPool> {
    let factory: ScorerFactory = Arc::new(|| Ok(Box::new(EnergyScorer::default()) as Box<dyn SpeechScorer>));
    Arc::new(VadPool::new(2, factory).unwrap())
}

/// Next state marker, skipping audio and text payloads
async fn next_marker(rx: &mut OutboundReceiver) -> String {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no marker in time")
            .expect("channel closed");
        if let Outbound::Text(text) = message {
            if text.starts_with("<state>") {
                return text;
            }
        }
    }
}

#[tokio::test]
async fn test_init_emits_success() {
    let config = VoiceChatConfig::default();
    let mut h = harness(SessionParams::default(), &config);

    let response = h.model.init().await.unwrap();
    assert!(response.success);
    assert!(h.model.state().lock().model_ready);
    assert_eq!(next_marker(&mut h.outbound).await, StateMarker::ModelInitSuccess.as_str());
}

#[tokio::test]
async fn test_simplex_turn_generates_after_silence() {
    let config = VoiceChatConfig::default();
    let mut h = harness(SessionParams::default(), &config);
    let input = Arc::new(DropOldestQueue::new(config.audio_input_queue));

    let turn_loop = TurnLoop::new(h.model.clone(), energy_pool(), config.clone(), input.clone());
    tokio::spawn(turn_loop.run(h.cancel.clone()));

    // 1.5 s of speech then 2 s of silence, fed in real time
    let feeder = tokio::spawn(async move {
        for i in 0..35 {
            let level = if i < 15 { 0.5 } else { 0.0 };
            input.push(vec![level; 4800]);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    assert_eq!(next_marker(&mut h.outbound).await, StateMarker::VadEnd.as_str());
    assert_eq!(next_marker(&mut h.outbound).await, StateMarker::GenerateStart.as_str());
    assert_eq!(next_marker(&mut h.outbound).await, StateMarker::GenerateFirstChunk.as_str());
    assert_eq!(next_marker(&mut h.outbound).await, StateMarker::GenerateEnd.as_str());
    h.cancel.cancel();
    feeder.abort();

    let prefills = h.backend.prefills.lock().clone();
    assert!(!prefills.is_empty());
    assert!(prefills.iter().all(|p| p.audio.is_some()));
    assert!(prefills.last().unwrap().is_last_chunk);
    let ids: Vec<_> = prefills.iter().filter_map(|p| p.image_audio_id).collect();
    assert_eq!(ids, (0..prefills.len() as u64).collect::<Vec<_>>());

    assert_eq!(h.backend.generates.load(Ordering::SeqCst), 1);
    assert_eq!(h.model.outputs().audio.len(), 1);
    assert_eq!(h.model.outputs().text.len(), 1);
    let state = h.model.state().lock();
    assert_eq!(state.round, 1);
    assert!(!state.generating);
    assert!(state.playback_active());
}

#[tokio::test]
async fn test_prefill_dropped_during_playback() {
    let config = VoiceChatConfig::default();
    let h = harness(SessionParams::default(), &config);
    h.model.state().lock().start_generate();

    assert!(!h.model.prefill_audio(&vec![0.1; 48000], false).await.unwrap());
    assert!(h.backend.prefills.lock().is_empty());

    h.model.state().lock().play_end = true;
    assert!(h.model.prefill_audio(&vec![0.1; 48000], false).await.unwrap());
    assert_eq!(h.backend.prefills.lock().len(), 1);
}

#[tokio::test]
async fn test_duplex_prefills_and_generates() {
    let config = VoiceChatConfig::default();
    let params = SessionParams {
        model_type: ModelType::Duplex,
        ..Default::default()
    };
    let h = harness(params, &config);
    let input = Arc::new(DropOldestQueue::new(config.audio_input_queue));
    input.push(vec![0.1; 48000]);

    let turn_loop = TurnLoop::new(h.model.clone(), energy_pool(), config.clone(), input);
    tokio::spawn(turn_loop.run(h.cancel.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.backend.generates.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    h.cancel.cancel();

    assert_eq!(h.backend.prefills.lock().len(), 1);
}

#[tokio::test]
async fn test_raced_generate_hidden_until_promoted() {
    let config = VoiceChatConfig::default();
    let mut h = harness(SessionParams::default(), &config);

    let sink = Arc::new(OutputSink::raced(h.model.outputs().clone(), &config));
    h.model.generate(sink.clone()).await.unwrap();

    assert!(h.outbound.try_recv().is_none());
    assert!(h.model.outputs().audio.is_empty());

    // The race finished before the turn was confirmed; its markers follow
    // the promotion
    assert_eq!(h.model.promote(&sink), 1);
    assert_eq!(next_marker(&mut h.outbound).await, StateMarker::GenerateStart.as_str());
    assert_eq!(next_marker(&mut h.outbound).await, StateMarker::GenerateFirstChunk.as_str());
    assert_eq!(next_marker(&mut h.outbound).await, StateMarker::GenerateEnd.as_str());
    assert_eq!(h.model.outputs().audio.len(), 1);
    assert_eq!(h.model.outputs().text.drain(), vec!["hello".to_string()]);
}

#[tokio::test]
async fn test_resumed_speech_discards_race() {
    let config = VoiceChatConfig::default();
    let params = SessionParams {
        vad_race: true,
        ..Default::default()
    };
    let mut h = harness(params, &config);
    let input = Arc::new(DropOldestQueue::new(config.audio_input_queue));

    let turn_loop = TurnLoop::new(h.model.clone(), energy_pool(), config.clone(), input.clone());
    tokio::spawn(turn_loop.run(h.cancel.clone()));

    // 1 s of speech, a pause long enough to race but too short to confirm
    // silence, then speech again
    let pattern: Vec<f32> = std::iter::repeat(0.5)
        .take(10)
        .chain(std::iter::repeat(0.0).take(8))
        .chain(std::iter::repeat(0.5).take(6))
        .collect();
    for level in pattern {
        input.push(vec![level; 4800]);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.cancel.cancel();

    assert_eq!(h.backend.generates.load(Ordering::SeqCst), 1);
    assert_eq!(h.backend.breaks.load(Ordering::SeqCst), 1);
    assert!(h.model.outputs().audio.is_empty());
    assert!(h.model.outputs().text.is_empty());

    let mut leaked = Vec::new();
    while let Some(message) = h.outbound.try_recv() {
        match message {
            Outbound::Audio(_) => leaked.push("audio".to_string()),
            Outbound::Text(text) if text.contains(r#""text""#) || text.starts_with("<state><generate") => {
                leaked.push(text)
            }
            _ => {}
        }
    }
    assert!(leaked.is_empty(), "raced output leaked: {:?}", leaked);
    assert!(!h.model.state().lock().playback_active());
}

#[tokio::test]
async fn test_break_clears_outputs() {
    let config = VoiceChatConfig::default();
    let mut h = harness(SessionParams::default(), &config);
    h.model.outputs().audio.push(vec![0.1; 960]);
    h.model.state().lock().start_generate();

    h.model.break_generation().await;

    assert_eq!(next_marker(&mut h.outbound).await, StateMarker::SessionBreak.as_str());
    assert_eq!(h.backend.breaks.load(Ordering::SeqCst), 1);
    assert!(h.model.outputs().audio.is_empty());
    let state = h.model.state().lock();
    assert_eq!(state.round, 1);
    assert!(!state.playback_active());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let config = VoiceChatConfig::default();
    let h = harness(SessionParams::default(), &config);

    h.model.stop().await;
    h.model.stop().await;
    assert_eq!(h.backend.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_output_pump_paces_frames() {
    let config = VoiceChatConfig::default();
    let mut h = harness(SessionParams::default(), &config);
    {
        let mut state = h.model.state().lock();
        state.start_generate();
        state.finish_generate(true);
    }
    h.model.outputs().audio.push(vec![0.3; 960 * 3 + 100]);
    h.model.outputs().text.push("hi".to_string());

    tokio::spawn(run_output(h.model.clone(), config.clone(), h.cancel.clone()));

    let mut texts = Vec::new();
    let mut frames = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while frames.len() < 4 {
        let message = tokio::time::timeout_at(deadline, h.outbound.recv())
            .await
            .expect("output pump stalled")
            .unwrap();
        match message {
            Outbound::Text(text) => texts.push(text),
            Outbound::Audio(frame) => frames.push(frame),
            Outbound::Close => unreachable!(),
        }
    }
    h.cancel.cancel();

    assert!(texts.iter().any(|t| t.contains(r#""text":"hi""#)));
    assert!(texts.contains(&StateMarker::AudioStart.as_str().to_string()));
    assert!(frames[..3].iter().all(|f| f.len() == 960));
    assert!(h.model.state().lock().speaking);
}

//! Output multiplexer tests over a scratch output directory

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parley::audio::wav::write_wav;
use parley::protocol::GenerateEvent;
use parley::worker::engine::{ByteStream, DecodeRequest, EnginePrefill, OmniInit, SessionConfigUpdate};
use parley::worker::multiplex::{duplex_events, simplex_events, DuplexCursor, ScanTiming};
use parley::worker::StreamEngine;
use parley::{ParleyError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Writes its artifacts when decode starts, then answers with `body`
struct ArtifactEngine {
    dir: PathBuf,
    wavs: Vec<(u64, usize)>,
    files: Vec<(String, String)>,
    body: Vec<String>,
    /// Raised once the artifacts are on disk
    raise_break: Option<Arc<AtomicBool>>,
}

#[async_trait]
impl StreamEngine for ArtifactEngine {
    async fn omni_init(&self, _request: &OmniInit) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn update_session_config(&self, _request: &SessionConfigUpdate) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn prefill(&self, _request: &EnginePrefill) -> Result<()> {
        Ok(())
    }

    async fn decode(&self, _request: &DecodeRequest) -> Result<ByteStream> {
        let wav_dir = self.dir.join("tts_wav");
        std::fs::create_dir_all(&wav_dir)?;
        for (relative, content) in &self.files {
            let path = self.dir.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }
        for (index, samples) in &self.wavs {
            write_wav(wav_dir.join(format!("wav_{}.wav", index)), &vec![0.25; *samples], 24000)?;
        }
        if let Some(flag) = &self.raise_break {
            flag.store(true, Ordering::SeqCst);
        }
        let records: Vec<Result<Bytes>> = self
            .body
            .iter()
            .map(|payload| Ok(Bytes::from(format!("data: {}\n\n", payload))))
            .collect();
        Ok(stream::iter(records).boxed())
    }

    async fn break_generation(&self) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> Result<bool> {
        Ok(true)
    }
}

struct FailingEngine;

#[async_trait]
impl StreamEngine for FailingEngine {
    async fn omni_init(&self, _request: &OmniInit) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn update_session_config(&self, _request: &SessionConfigUpdate) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn prefill(&self, _request: &EnginePrefill) -> Result<()> {
        Ok(())
    }

    async fn decode(&self, _request: &DecodeRequest) -> Result<ByteStream> {
        Err(ParleyError::backend(None, "engine down"))
    }

    async fn break_generation(&self) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> Result<bool> {
        Ok(false)
    }
}

fn decode_request(dir: &Path) -> DecodeRequest {
    DecodeRequest {
        debug_dir: dir.to_string_lossy().to_string(),
        stream: true,
        round_idx: Some(0),
    }
}

async fn drain(events: impl futures::Stream<Item = GenerateEvent>) -> Vec<GenerateEvent> {
    tokio::time::timeout(Duration::from_secs(5), events.collect::<Vec<_>>())
        .await
        .expect("event stream did not end")
}

#[tokio::test]
async fn test_simplex_emits_artifacts_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let round = dir.path().join("round_000");
    let engine = Arc::new(ArtifactEngine {
        dir: round.clone(),
        wavs: vec![(0, 2400), (1, 4800), (2, 1200)],
        files: vec![
            ("llm_debug/chunk_0/llm_text.txt".into(), "Hello".into()),
            ("llm_debug/chunk_1/llm_text.txt".into(), " there".into()),
            ("tts_wav/generation_done.flag".into(), "2".into()),
        ],
        body: Vec::new(),
        raise_break: None,
    });

    let events = drain(simplex_events(
        engine,
        decode_request(dir.path()),
        round,
        ScanTiming::simplex(5, 3),
        Arc::new(AtomicBool::new(false)),
    ))
    .await;

    assert_eq!(events.len(), 4);
    let indices: Vec<_> = events[..3].iter().map(|e| e.chunk_idx).collect();
    assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);

    let texts: Vec<_> = events[..3]
        .iter()
        .map(|e| e.chunk_data.as_ref().and_then(|d| d.text.clone()))
        .collect();
    assert_eq!(texts, vec![Some("Hello".into()), Some("there".into()), None]);

    let first = events[0].chunk_data.as_ref().unwrap();
    assert_eq!(first.sample_rate, 24000);
    // raw PCM16, two bytes per sample
    assert_eq!(
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &first.wav)
            .unwrap()
            .len(),
        4800
    );

    assert!(events[3].done);
    assert!(!events[3].interrupted);
}

#[tokio::test]
async fn test_simplex_ignores_stale_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let round = dir.path().join("round_000");
    std::fs::create_dir_all(round.join("tts_wav")).unwrap();
    write_wav(round.join("tts_wav/wav_9.wav"), &[0.1; 100], 24000).unwrap();

    let engine = Arc::new(ArtifactEngine {
        dir: round.clone(),
        wavs: vec![(0, 480)],
        files: vec![("tts_wav/generation_done.flag".into(), "0".into())],
        body: Vec::new(),
        raise_break: None,
    });

    let events = drain(simplex_events(
        engine,
        decode_request(dir.path()),
        round,
        ScanTiming::simplex(5, 3),
        Arc::new(AtomicBool::new(false)),
    ))
    .await;

    let chunks: Vec<_> = events.iter().filter(|e| e.chunk_idx.is_some()).collect();
    assert_eq!(chunks.len(), 1);
    assert!(events.last().unwrap().done);
}

#[tokio::test]
async fn test_simplex_no_output_ends_with_done() {
    let dir = tempfile::tempdir().unwrap();
    let round = dir.path().join("round_000");
    let engine = Arc::new(ArtifactEngine {
        dir: round.clone(),
        wavs: Vec::new(),
        files: Vec::new(),
        body: Vec::new(),
        raise_break: None,
    });

    let events = drain(simplex_events(
        engine,
        decode_request(dir.path()),
        round,
        ScanTiming::simplex(5, 3),
        Arc::new(AtomicBool::new(false)),
    ))
    .await;

    assert_eq!(events, vec![GenerateEvent::done()]);
}

#[tokio::test]
async fn test_simplex_decode_failure() {
    let dir = tempfile::tempdir().unwrap();
    let events = drain(simplex_events(
        Arc::new(FailingEngine),
        decode_request(dir.path()),
        dir.path().join("round_000"),
        ScanTiming::simplex(5, 3),
        Arc::new(AtomicBool::new(false)),
    ))
    .await;

    assert_eq!(events.len(), 1);
    assert!(events[0].error.is_some());
    assert!(events[0].is_terminal());
}

#[tokio::test]
async fn test_simplex_break_flag() {
    let dir = tempfile::tempdir().unwrap();
    let round = dir.path().join("round_000");
    let engine = Arc::new(ArtifactEngine {
        dir: round.clone(),
        wavs: Vec::new(),
        files: Vec::new(),
        body: Vec::new(),
        raise_break: None,
    });

    let events = drain(simplex_events(
        engine,
        decode_request(dir.path()),
        round,
        ScanTiming::simplex(5, 3),
        Arc::new(AtomicBool::new(true)),
    ))
    .await;

    assert_eq!(events, vec![GenerateEvent::interrupted()]);
}

#[tokio::test]
async fn test_duplex_pairs_text_and_hands_turn_back() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ArtifactEngine {
        dir: dir.path().to_path_buf(),
        wavs: vec![(0, 960), (1, 960)],
        files: vec![("llm_debug/llm_text.txt".into(), "[chunk_0] Sure\n[chunk_1] thing\n".into())],
        body: vec![
            r#"{"is_listen": false, "text": "Sure"}"#.into(),
            r#"{"is_listen": true}"#.into(),
        ],
        raise_break: None,
    });
    let cursor = Arc::new(Mutex::new(DuplexCursor::default()));

    let events = drain(duplex_events(
        engine,
        decode_request(dir.path()),
        dir.path().to_path_buf(),
        cursor.clone(),
        ScanTiming::duplex(5, 200, 2),
        Arc::new(AtomicBool::new(false)),
    ))
    .await;

    let chunks: Vec<_> = events.iter().filter(|e| e.chunk_idx.is_some()).collect();
    let listening: Vec<_> = events
        .iter()
        .filter(|e| e.is_listen == Some(true) && !e.done)
        .collect();
    let last = events.last().unwrap();

    assert!(chunks.len() <= 2);
    assert_eq!(listening.len(), 1);
    assert!(last.done);
    assert_eq!(last.is_listen, Some(true));
    assert_eq!(events.iter().filter(|e| e.done).count(), 1);

    let c = cursor.lock();
    assert_eq!(c.sent_wav_count, chunks.len() as u64);
    assert_eq!(c.parsed_texts, vec!["Sure", "thing"]);
}

#[tokio::test]
async fn test_duplex_chunk_index_continues_across_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let cursor = Arc::new(Mutex::new(DuplexCursor {
        sent_wav_count: 5,
        ..Default::default()
    }));
    let engine = Arc::new(ArtifactEngine {
        dir: dir.path().to_path_buf(),
        wavs: vec![(5, 960)],
        files: Vec::new(),
        body: vec![r#"{"end_of_turn": true}"#.into()],
        raise_break: None,
    });

    let events = drain(duplex_events(
        engine,
        decode_request(dir.path()),
        dir.path().to_path_buf(),
        cursor.clone(),
        ScanTiming::duplex(5, 500, 3),
        Arc::new(AtomicBool::new(false)),
    ))
    .await;

    let chunk = events.iter().find(|e| e.chunk_idx.is_some()).unwrap();
    assert_eq!(chunk.chunk_idx, Some(5));
    let last = events.last().unwrap();
    assert!(last.done);
    assert_eq!(last.chunks_received, Some(6));
}

#[tokio::test]
async fn test_duplex_break() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ArtifactEngine {
        dir: dir.path().to_path_buf(),
        wavs: Vec::new(),
        files: Vec::new(),
        body: Vec::new(),
        raise_break: None,
    });

    let events = drain(duplex_events(
        engine,
        decode_request(dir.path()),
        dir.path().to_path_buf(),
        Arc::new(Mutex::new(DuplexCursor::default())),
        ScanTiming::duplex(5, 100, 2),
        Arc::new(AtomicBool::new(true)),
    ))
    .await;

    assert_eq!(events, vec![GenerateEvent::interrupted()]);
}

#[tokio::test]
async fn test_simplex_break_with_artifacts_ready() {
    let dir = tempfile::tempdir().unwrap();
    let round = dir.path().join("round_000");
    let breaking = Arc::new(AtomicBool::new(false));
    let engine = Arc::new(ArtifactEngine {
        dir: round.clone(),
        wavs: (0..5).map(|i| (i, 480)).collect(),
        files: vec![("tts_wav/generation_done.flag".into(), "4".into())],
        body: Vec::new(),
        raise_break: Some(breaking.clone()),
    });

    let events = drain(simplex_events(
        engine,
        decode_request(dir.path()),
        round,
        ScanTiming::simplex(5, 3),
        breaking,
    ))
    .await;

    assert_eq!(events, vec![GenerateEvent::interrupted()]);
}

#[tokio::test]
async fn test_duplex_break_with_artifacts_ready() {
    let dir = tempfile::tempdir().unwrap();
    let breaking = Arc::new(AtomicBool::new(false));
    let cursor = Arc::new(Mutex::new(DuplexCursor::default()));
    let engine = Arc::new(ArtifactEngine {
        dir: dir.path().to_path_buf(),
        wavs: (0..5).map(|i| (i, 480)).collect(),
        files: Vec::new(),
        body: vec![r#"{"is_listen": false}"#.into()],
        raise_break: Some(breaking.clone()),
    });

    let events = drain(duplex_events(
        engine,
        decode_request(dir.path()),
        dir.path().to_path_buf(),
        cursor,
        ScanTiming::duplex(5, 100, 2),
        breaking,
    ))
    .await;

    assert_eq!(events, vec![GenerateEvent::interrupted()]);
}

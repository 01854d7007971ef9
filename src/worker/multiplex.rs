//! Turns engine output artifacts into an ordered event stream
//!
//! The engine writes `wav_<k>.wav` files as it synthesizes and logs text to
//! side files. There is no push notification for new files, so both
//! strategies poll the output directory at a fixed interval and give up
//! after a run of idle polls.

use super::engine::{DecodeRequest, StreamEngine};
use crate::audio::{f32_to_i16, pcm16_to_le_bytes, wav::read_wav};
use crate::protocol::{ChunkData, GenerateEvent, SseDecoder};
use crate::{ParleyError, Result};
use async_stream::stream;
use base64::{engine::general_purpose::STANDARD, Engine};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reads of one artifact that may fail before it is skipped
const MAX_READ_ATTEMPTS: u32 = 3;

/// Upper bound on one simplex round
const SIMPLEX_MAX_WAIT: Duration = Duration::from_secs(1800);

/// Grace period for the decode call after the scan ended
const DECODE_GRACE: Duration = Duration::from_secs(30);
/// Duplex chunks read from disk but not yet yielded
const DUPLEX_EVENT_QUEUE: usize = 64;

/// Poll intervals and idle limits
#[derive(Clone, Debug)]
pub struct ScanTiming {
    pub poll: Duration,
    /// Simplex: polls without output after decode returned with no chunks
    pub idle_polls: u32,
    /// Duplex: how long to keep draining after the control stream ended
    pub final_wait: Duration,
    /// Duplex: empty drain passes that end the final wait early
    pub final_idle_polls: u32,
}

impl ScanTiming {
    pub fn simplex(poll_ms: u64, idle_polls: u32) -> Self {
        Self {
            poll: Duration::from_millis(poll_ms),
            idle_polls,
            final_wait: Duration::ZERO,
            final_idle_polls: 0,
        }
    }

    pub fn duplex(poll_ms: u64, final_wait_ms: u64, final_idle_polls: u32) -> Self {
        Self {
            poll: Duration::from_millis(poll_ms),
            idle_polls: 0,
            final_wait: Duration::from_millis(final_wait_ms),
            final_idle_polls,
        }
    }
}

/// Session-wide duplex bookkeeping. Duplex output lives in one flat
/// directory for the whole session, so these survive across rounds.
#[derive(Clone, Debug, Default)]
pub struct DuplexCursor {
    pub sent_wav_count: u64,
    pub parsed_line_count: usize,
    pub parsed_texts: Vec<String>,
    pub text_send_idx: usize,
    pub sent_wav_files: HashSet<String>,
}

/// Numeric suffix of `wav_<k>.wav`
pub fn wav_index(name: &str) -> Option<u64> {
    name.strip_prefix("wav_")?.strip_suffix(".wav")?.parse().ok()
}

/// Artifacts in `dir` sorted by their numeric suffix
pub fn list_wavs(dir: &Path) -> Vec<(u64, String)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut wavs: Vec<(u64, String)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|name| wav_index(&name).map(|idx| (idx, name)))
        .collect();
    wavs.sort();
    wavs
}

/// Encode one artifact as raw PCM16 base64. `None` for an empty file.
pub fn read_chunk(path: &Path) -> Result<Option<(ChunkData, f64)>> {
    let (samples, sample_rate) = read_wav(path)?;
    if samples.is_empty() {
        return Ok(None);
    }
    let duration = samples.len() as f64 / sample_rate as f64;
    let wav = STANDARD.encode(pcm16_to_le_bytes(&f32_to_i16(&samples)));
    Ok(Some((
        ChunkData {
            wav,
            sample_rate,
            text: None,
        },
        duration,
    )))
}

/// Parse `[chunk_N] text` lines of the duplex text log from `from_line` on.
/// Lines without the tag are taken whole; blank ones are skipped.
pub fn parse_text_log(content: &str, from_line: usize) -> (Vec<String>, usize) {
    let lines: Vec<&str> = content.lines().collect();
    let mut texts = Vec::new();

    for line in lines.iter().skip(from_line) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let text = match line.strip_prefix("[chunk_") {
            Some(rest) => match rest.split_once(']') {
                Some((digits, text)) if digits.chars().all(|c| c.is_ascii_digit()) => text.trim(),
                _ => line,
            },
            None => line,
        };
        if !text.is_empty() {
            texts.push(text.to_string());
        }
    }
    (texts, lines.len())
}

fn read_done_flag(wav_dir: &Path) -> Option<u64> {
    std::fs::read_to_string(wav_dir.join("generation_done.flag"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn read_chunk_text(llm_dir: &Path, index: u64) -> Option<String> {
    let text = std::fs::read_to_string(llm_dir.join(format!("chunk_{}", index)).join("llm_text.txt")).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Per-round poll scan over `<round_dir>/tts_wav`
///
/// Decode runs in the background while new artifacts are emitted with a
/// sequential `chunk_idx` starting at 0. Ends with a single `done`, or a
/// single `break` when `breaking` is raised.
pub fn simplex_events(
    engine: Arc<dyn StreamEngine>,
    request: DecodeRequest,
    round_dir: PathBuf,
    timing: ScanTiming,
    breaking: Arc<AtomicBool>,
) -> impl Stream<Item = GenerateEvent> {
    stream! {
        let wav_dir = round_dir.join("tts_wav");
        let llm_dir = round_dir.join("llm_debug");
        let existing: HashSet<String> = list_wavs(&wav_dir).into_iter().map(|(_, name)| name).collect();
        if !existing.is_empty() {
            debug!(count = existing.len(), "ignoring stale artifacts in {}", wav_dir.display());
        }

        let mut decode = tokio::spawn(async move {
            let mut body = engine.decode(&request).await?;
            while let Some(chunk) = body.next().await {
                chunk?;
            }
            Ok::<(), ParleyError>(())
        });

        let started = Instant::now();
        let mut decode_done = false;
        let mut sent: HashSet<String> = HashSet::new();
        let mut failures: HashMap<String, u32> = HashMap::new();
        let mut seq: u64 = 0;
        let mut llm_chunk_idx: u64 = 0;
        let mut idle: u32 = 0;

        loop {
            tokio::time::sleep(timing.poll).await;

            if breaking.load(Ordering::SeqCst) {
                info!(chunks = seq, "generation interrupted");
                decode.abort();
                yield GenerateEvent::interrupted();
                return;
            }

            if !decode_done && decode.is_finished() {
                decode_done = true;
                match (&mut decode).await {
                    Ok(Ok(())) => debug!("decode returned"),
                    Ok(Err(e)) => {
                        warn!("decode failed: {}", e);
                        yield GenerateEvent::failed("decode failed");
                        return;
                    }
                    Err(e) => warn!("decode task ended abnormally: {}", e),
                }
            }

            let mut progressed = false;
            for (_, name) in list_wavs(&wav_dir) {
                if breaking.load(Ordering::SeqCst) {
                    break;
                }
                if existing.contains(&name) || sent.contains(&name) {
                    continue;
                }
                match read_chunk(&wav_dir.join(&name)) {
                    Ok(Some((mut data, _))) => {
                        if let Some(text) = read_chunk_text(&llm_dir, llm_chunk_idx) {
                            llm_chunk_idx += 1;
                            data.text = Some(text);
                        }
                        yield GenerateEvent::chunk(seq, data);
                        seq += 1;
                        sent.insert(name);
                        progressed = true;
                    }
                    Ok(None) => {
                        sent.insert(name);
                    }
                    Err(e) => {
                        // Most likely still being written
                        let attempts = failures.entry(name.clone()).or_insert(0);
                        *attempts += 1;
                        if *attempts >= MAX_READ_ATTEMPTS {
                            warn!("skipping unreadable artifact {}: {}", name, e);
                            sent.insert(name);
                        }
                    }
                }
            }

            if breaking.load(Ordering::SeqCst) {
                info!(chunks = seq, "generation interrupted");
                decode.abort();
                yield GenerateEvent::interrupted();
                return;
            }

            if let Some(last) = read_done_flag(&wav_dir) {
                let last_name = format!("wav_{}.wav", last);
                if sent.contains(&last_name) || existing.contains(&last_name) {
                    debug!(chunks = seq, "generation done flag reached");
                    break;
                }
            }

            if progressed {
                idle = 0;
            } else {
                idle += 1;
            }
            if decode_done && seq == 0 && idle >= timing.idle_polls {
                warn!("decode finished without output");
                break;
            }
            if decode_done && idle >= timing.idle_polls.saturating_mul(30) {
                warn!(chunks = seq, "no done flag, ending after idle timeout");
                break;
            }
            if started.elapsed() > SIMPLEX_MAX_WAIT {
                warn!(chunks = seq, "round exceeded the maximum wait");
                break;
            }
        }

        if !decode.is_finished() {
            match tokio::time::timeout(DECODE_GRACE, &mut decode).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("decode still running after the scan, abandoning it");
                    decode.abort();
                }
            }
        }

        info!(chunks = seq, elapsed_ms = started.elapsed().as_millis() as u64, "round complete");
        yield GenerateEvent::done();
    }
}

/// Control fields of one engine SSE record
#[derive(Debug, Default, PartialEq)]
pub struct ControlSignal {
    pub is_listen: Option<bool>,
    pub end_of_turn: bool,
    pub text: Option<String>,
}

pub fn parse_control(payload: &str) -> Option<ControlSignal> {
    let value: Value = serde_json::from_str(payload).ok()?;
    Some(ControlSignal {
        is_listen: value.get("is_listen").and_then(Value::as_bool),
        end_of_turn: value.get("end_of_turn").and_then(Value::as_bool).unwrap_or(false),
        text: value
            .get("text")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
    })
}

/// Flat-directory scanner feeding `tx` until `stop` fires. Returns the
/// seconds of audio it queued.
async fn scan_duplex(
    output_dir: PathBuf,
    cursor: Arc<Mutex<DuplexCursor>>,
    tx: mpsc::Sender<GenerateEvent>,
    poll: Duration,
    breaking: Arc<AtomicBool>,
    stop: CancellationToken,
) -> f64 {
    let wav_dir = output_dir.join("tts_wav");
    let text_log = output_dir.join("llm_debug").join("llm_text.txt");
    let mut failures: HashMap<String, u32> = HashMap::new();
    let mut total_seconds = 0.0;

    while !stop.is_cancelled() {
        if wav_dir.is_dir() {
            if let Ok(content) = std::fs::read_to_string(&text_log) {
                let mut c = cursor.lock();
                let (texts, line_count) = parse_text_log(&content, c.parsed_line_count);
                c.parsed_texts.extend(texts);
                c.parsed_line_count = line_count;
            }

            for (_, name) in list_wavs(&wav_dir) {
                if breaking.load(Ordering::SeqCst) {
                    return total_seconds;
                }
                if cursor.lock().sent_wav_files.contains(&name) {
                    continue;
                }
                match read_chunk(&wav_dir.join(&name)) {
                    Ok(Some((mut data, seconds))) => {
                        let chunk_idx = {
                            let mut c = cursor.lock();
                            c.sent_wav_files.insert(name);
                            if c.text_send_idx < c.parsed_texts.len() {
                                data.text = Some(c.parsed_texts[c.text_send_idx].clone());
                                c.text_send_idx += 1;
                            }
                            let chunk_idx = c.sent_wav_count;
                            c.sent_wav_count += 1;
                            chunk_idx
                        };

                        total_seconds += seconds;
                        tokio::select! {
                            sent = tx.send(GenerateEvent::chunk(chunk_idx, data)) => {
                                if sent.is_err() {
                                    return total_seconds;
                                }
                            }
                            _ = stop.cancelled() => return total_seconds,
                        }
                    }
                    Ok(None) => {
                        cursor.lock().sent_wav_files.insert(name);
                    }
                    Err(e) => {
                        let attempts = failures.entry(name.clone()).or_insert(0);
                        *attempts += 1;
                        if *attempts >= MAX_READ_ATTEMPTS {
                            warn!("skipping unreadable artifact {}: {}", name, e);
                            cursor.lock().sent_wav_files.insert(name);
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(poll) => {}
        }
    }
    total_seconds
}

/// Duplex generate: artifacts are polled from the flat output directory
/// while `is_listen`/`end_of_turn` come inline on the decode body.
///
/// `chunk_idx` continues across rounds through `cursor`.
pub fn duplex_events(
    engine: Arc<dyn StreamEngine>,
    request: DecodeRequest,
    output_dir: PathBuf,
    cursor: Arc<Mutex<DuplexCursor>>,
    timing: ScanTiming,
    breaking: Arc<AtomicBool>,
) -> impl Stream<Item = GenerateEvent> {
    stream! {
        let (tx, mut rx) = mpsc::channel(DUPLEX_EVENT_QUEUE);
        let stop = CancellationToken::new();
        let mut scanner = tokio::spawn(scan_duplex(
            output_dir,
            cursor.clone(),
            tx,
            timing.poll,
            breaking.clone(),
            stop.clone(),
        ));

        let mut body = match engine.decode(&request).await {
            Ok(body) => body,
            Err(e) => {
                warn!("decode failed: {}", e);
                stop.cancel();
                yield GenerateEvent::failed("decode failed");
                return;
            }
        };

        let mut sse = SseDecoder::new();
        let mut is_listen = true;
        let mut interrupted = false;
        let mut inline_text = String::new();

        'control: loop {
            if breaking.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }
            while !breaking.load(Ordering::SeqCst) {
                let Ok(event) = rx.try_recv() else { break };
                yield event;
            }

            let bytes = match tokio::time::timeout(Duration::from_millis(100), body.next()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!("decode stream error: {}", e);
                    break;
                }
                Ok(Some(Ok(bytes))) => bytes,
            };

            for payload in sse.push(&bytes) {
                let Some(signal) = parse_control(&payload) else {
                    continue;
                };
                if let Some(text) = signal.text {
                    inline_text.push_str(&text);
                }
                while !breaking.load(Ordering::SeqCst) {
                    let Ok(event) = rx.try_recv() else { break };
                    yield event;
                }

                if let Some(listen) = signal.is_listen {
                    is_listen = listen;
                }
                if signal.is_listen == Some(true) {
                    // Catch artifacts written just before the turn flipped
                    let quick = Instant::now();
                    let mut rounds = 0;
                    while quick.elapsed() < Duration::from_millis(50) {
                        rounds += 1;
                        let mut found = false;
                        while let Ok(event) = rx.try_recv() {
                            found = true;
                            yield event;
                        }
                        if !found && rounds >= 2 {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    let sent = cursor.lock().sent_wav_count;
                    yield GenerateEvent::listening(sent);
                    break 'control;
                }
                if signal.end_of_turn {
                    debug!("end of turn");
                    break 'control;
                }
            }
        }

        if interrupted || breaking.load(Ordering::SeqCst) {
            stop.cancel();
            scanner.abort();
            info!("generation interrupted");
            yield GenerateEvent::interrupted();
            return;
        }

        let final_start = Instant::now();
        let mut idle = 0;
        while final_start.elapsed() < timing.final_wait {
            let mut got = false;
            while let Ok(event) = rx.try_recv() {
                got = true;
                yield event;
            }
            if got {
                idle = 0;
            } else {
                idle += 1;
                if idle >= timing.final_idle_polls {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        stop.cancel();
        let audio_seconds = match tokio::time::timeout(Duration::from_secs(1), &mut scanner).await {
            Ok(Ok(seconds)) => seconds,
            _ => {
                scanner.abort();
                0.0
            }
        };
        while let Ok(event) = rx.try_recv() {
            yield event;
        }

        if !inline_text.is_empty() {
            debug!(text = %inline_text, "inline text");
        }
        let chunks_received = cursor.lock().sent_wav_count;
        info!(chunks_received, audio_seconds, "duplex round complete");
        yield GenerateEvent {
            done: true,
            is_listen: Some(is_listen),
            chunks_received: Some(chunks_received),
            audio_duration_seconds: Some(audio_seconds),
            ..Default::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_index() {
        assert_eq!(wav_index("wav_12.wav"), Some(12));
        assert_eq!(wav_index("wav_.wav"), None);
        assert_eq!(wav_index("generation_done.flag"), None);
        assert_eq!(wav_index("wav_3.txt"), None);
    }

    #[test]
    fn test_list_sorted_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["wav_10.wav", "wav_2.wav", "wav_1.wav", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let names: Vec<String> = list_wavs(dir.path()).into_iter().map(|(_, n)| n).collect();
        assert_eq!(names, vec!["wav_1.wav", "wav_2.wav", "wav_10.wav"]);
        assert!(list_wavs(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn test_parse_text_log_resumes() {
        let content = "[chunk_0] hello\n\nplain line\n[chunk_1]   \n";
        let (texts, lines) = parse_text_log(content, 0);
        assert_eq!(texts, vec!["hello", "plain line"]);
        assert_eq!(lines, 4);

        let more = format!("{}[chunk_2] again\n", content);
        let (texts, lines) = parse_text_log(&more, lines);
        assert_eq!(texts, vec!["again"]);
        assert_eq!(lines, 5);
    }

    #[test]
    fn test_parse_control() {
        let signal = parse_control(r#"{"is_listen":true,"text":""}"#).unwrap();
        assert_eq!(signal.is_listen, Some(true));
        assert!(signal.text.is_none());
        assert!(parse_control(r#"{"end_of_turn":true}"#).unwrap().end_of_turn);
        assert!(parse_control("not json").is_none());
    }
}

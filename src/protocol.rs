//! Wire types shared by the gateway and the worker

use serde::{Deserialize, Serialize};

/// Body of `POST /omni/init_sys_prompt`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InitRequest {
    /// `"audio"` or `"omni"`, omni when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplex_mode: Option<bool>,
    #[serde(default)]
    pub high_quality_mode: bool,
    #[serde(default)]
    pub high_fps_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitResponse {
    pub success: bool,
    pub message: String,
    pub msg_type: u8,
    pub duplex_mode: bool,
    pub session_id: String,
    pub fast_resume: bool,
}

/// Body of `POST /omni/streaming_prefill`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PrefillRequest {
    /// Base64 WAV
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    /// Base64 JPEG or PNG
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Pairing id linking sub-frames to the audio that closes them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_audio_id: Option<u64>,
    /// 0 is the primary frame, 1..=4 are sub-frames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slice_nums: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, alias = "last_chunk")]
    pub is_last_chunk: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PrefillResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnt: Option<u64>,
}

/// Generated audio for one chunk
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkData {
    /// Base64 of raw little-endian PCM16 samples
    pub wav: String,
    pub sample_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// One record of the `streaming_generate` event stream
///
/// Flat on the wire: a chunk carries `chunk_idx` and `chunk_data`, terminal
/// records carry `done`, an interrupted round carries `break` as well.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_idx: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_data: Option<ChunkData>,
    #[serde(default, rename = "break", skip_serializing_if = "is_false")]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_listen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks_received: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl GenerateEvent {
    pub fn chunk(chunk_idx: u64, data: ChunkData) -> Self {
        Self {
            chunk_idx: Some(chunk_idx),
            chunk_data: Some(data),
            ..Default::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }

    pub fn interrupted() -> Self {
        Self {
            interrupted: true,
            done: true,
            message: Some("Generation interrupted".to_string()),
            ..Default::default()
        }
    }

    /// The model handed the turn back to the user
    pub fn listening(chunks_received: u64) -> Self {
        Self {
            is_listen: Some(true),
            chunks_received: Some(chunks_received),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Ends the event stream
    pub fn is_terminal(&self) -> bool {
        self.done || self.error.is_some()
    }
}

/// Incremental parser for `text/event-stream` bodies
///
/// Records are separated by a blank line (`\n\n` or `\r\n\r\n`); only the
/// `data:` lines of each record are kept.
#[derive(Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning the data payload of every completed record
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut payloads = Vec::new();

        while let Some((end, sep_len)) = find_boundary(&self.buffer) {
            let record: String = self.buffer.drain(..end + sep_len).collect();
            let data: Vec<&str> = record[..end]
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
                .collect();
            if !data.is_empty() {
                payloads.push(data.join("\n"));
            }
        }
        payloads
    }

    /// Whatever is left once the body ends without a trailing blank line
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let data: Vec<&str> = rest
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|line| line.strip_prefix(' ').unwrap_or(line))
            .collect();
        (!data.is_empty()).then(|| data.join("\n"))
    }
}

fn find_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|i| (i, 2));
    let crlf = buffer.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(GenerateEvent::interrupted()).unwrap();
        assert_eq!(json["break"], true);
        assert_eq!(json["done"], true);
        assert!(json.get("chunk_idx").is_none());

        let chunk = GenerateEvent::chunk(
            3,
            ChunkData {
                wav: "AAA=".into(),
                sample_rate: 24000,
                text: None,
            },
        );
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["chunk_idx"], 3);
        assert!(json.get("done").is_none());
        assert!(json["chunk_data"].get("text").is_none());
        assert!(!chunk.is_terminal());
    }

    #[test]
    fn test_sse_split_across_pushes() {
        let mut sse = SseDecoder::new();
        assert!(sse.push(b"data: {\"a\":1}\n").is_empty());
        let out = sse.push(b"\ndata: {\"b\":2}\r\n\r\nevent: x\ndata: c");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        assert_eq!(sse.finish().as_deref(), Some("c"));
    }

    #[test]
    fn test_prefill_accepts_last_chunk_alias() {
        let req: PrefillRequest =
            serde_json::from_str(r#"{"audio":"x","last_chunk":true,"image_audio_id":4}"#).unwrap();
        assert!(req.is_last_chunk);
        assert_eq!(req.image_audio_id, Some(4));
    }
}

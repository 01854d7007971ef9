pub mod buffer;
pub mod frames;
pub mod resampler;
pub mod wav;

pub use buffer::AudioRingBuffer;
pub use frames::FrameSlicer;
pub use resampler::{resample_audio, AudioResampler};
pub use wav::{decode_wav, encode_wav, pad_to_min};

/// Media transport sample rate
pub const TRANSPORT_SAMPLE_RATE: u32 = 48000;

/// Sample rate the backend and the VAD expect
pub const MODEL_SAMPLE_RATE: u32 = 16000;

/// Default sample rate of generated speech
pub const TTS_SAMPLE_RATE: u32 = 24000;

/// Shortest chunk the backend accepts (100 ms at 16 kHz)
pub const MIN_PREFILL_SAMPLES: usize = 1600;

/// 20 ms at the transport rate
pub const FRAME_SAMPLES: usize = 960;

/// Convert PCM16 to normalized f32
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Convert normalized f32 to PCM16, clipping out-of-range values
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

/// Decode little-endian PCM16 bytes
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Milliseconds covered by `samples` at `sample_rate`
pub fn duration_ms(samples: usize, sample_rate: u32) -> f64 {
    samples as f64 / sample_rate as f64 * 1000.0
}

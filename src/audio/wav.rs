use crate::{ParleyError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

fn pcm16_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

/// Encode mono f32 samples as an in-memory PCM16 WAV file
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, pcm16_spec(sample_rate))?;
        for &sample in samples {
            writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Decode a WAV file into mono f32 samples, averaging channels
pub fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let reader = WavReader::new(Cursor::new(bytes))?;
    read_samples(reader)
}

pub fn encode_wav_base64(samples: &[f32], sample_rate: u32) -> Result<String> {
    Ok(BASE64.encode(encode_wav(samples, sample_rate)?))
}

pub fn decode_wav_base64(data: &str) -> Result<(Vec<f32>, u32)> {
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|e| ParleyError::AudioProcessingError(format!("Invalid base64 audio: {}", e)))?;
    decode_wav(&bytes)
}

/// Write mono f32 samples to a PCM16 WAV file on disk
pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let mut writer = WavWriter::create(path.as_ref(), pcm16_spec(sample_rate))?;
    for &sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    debug!("Wrote {} samples to {:?}", samples.len(), path.as_ref());
    Ok(())
}

/// Read a WAV file from disk as mono f32
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<(Vec<f32>, u32)> {
    let reader = WavReader::open(path.as_ref())?;
    read_samples(reader)
}

fn read_samples<R: std::io::Read>(mut reader: WavReader<R>) -> Result<(Vec<f32>, u32)> {
    let spec = reader.spec();
    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, _) => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<std::result::Result<_, _>>()?,
        (SampleFormat::Int, 24) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 8388608.0))
            .collect::<std::result::Result<_, _>>()?,
        (SampleFormat::Int, 32) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / i32::MAX as f32))
            .collect::<std::result::Result<_, _>>()?,
        (_, bits) => {
            return Err(ParleyError::AudioProcessingError(format!(
                "Unsupported bit depth: {}",
                bits
            )))
        }
    };

    let channels = spec.channels.max(1) as usize;
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };
    Ok((mono, spec.sample_rate))
}

/// Zero-pad `samples` up to `min_len`
pub fn pad_to_min(mut samples: Vec<f32>, min_len: usize) -> Vec<f32> {
    if samples.len() < min_len {
        samples.resize(min_len, 0.0);
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MIN_PREFILL_SAMPLES;
    use std::f32::consts::PI;

    fn sine(len: usize, sample_rate: u32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / sample_rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_in_memory_wav() {
        let samples = sine(16000, 16000);
        let bytes = encode_wav(&samples, 16000).unwrap();
        assert_eq!(&bytes[..4], b"RIFF");

        let (decoded, rate) = decode_wav(&bytes).unwrap();
        assert_eq!(rate, 16000);
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 0.001);
        }
    }

    #[test]
    fn test_stereo_downmix() {
        let spec = WavSpec {
            channels: 2,
            sample_rate: 24000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..10 {
                writer.write_sample(16384i16).unwrap();
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        let (mono, rate) = decode_wav(cursor.get_ref()).unwrap();
        assert_eq!(rate, 24000);
        assert_eq!(mono.len(), 10);
        assert!((mono[0] - 0.25).abs() < 0.001);
    }

    #[test]
    fn test_file_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk.wav");
        write_wav(&path, &sine(800, 16000), 16000).unwrap();
        let (samples, rate) = read_wav(&path).unwrap();
        assert_eq!(rate, 16000);
        assert_eq!(samples.len(), 800);
    }

    #[test]
    fn test_pad_short_chunk() {
        // 50 ms at 16 kHz
        let padded = pad_to_min(vec![0.3; 800], MIN_PREFILL_SAMPLES);
        assert_eq!(padded.len(), MIN_PREFILL_SAMPLES);
        assert_eq!(padded[799], 0.3);
        assert_eq!(padded[800], 0.0);

        let long = pad_to_min(vec![0.1; 2000], MIN_PREFILL_SAMPLES);
        assert_eq!(long.len(), 2000);
    }

    #[test]
    fn test_bad_base64() {
        assert!(decode_wav_base64("not base64 !!!").is_err());
    }
}

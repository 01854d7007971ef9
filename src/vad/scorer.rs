//! Speech-duration scoring for fixed audio windows
//!
//! A score is the number of seconds of detected speech in the window. The
//! turn engine feeds one-second windows, so a score is also the fraction of
//! the window that contains speech.

use crate::audio::MODEL_SAMPLE_RATE;
use crate::{ParleyError, Result};
use voice_activity_detector::VoiceActivityDetector as SileroDetector;

/// Scores a 16 kHz mono window
pub trait SpeechScorer: Send {
    fn speech_seconds(&mut self, samples: &[f32]) -> Result<f32>;
}

/// Silero-backed scorer
pub struct SileroScorer {
    detector: SileroDetector,
    chunk_size: usize,
    threshold: f32,
}

impl SileroScorer {
    /// `threshold` is the per-chunk speech probability (0.0-1.0)
    pub fn new(threshold: f32) -> Result<Self> {
        let chunk_size = 512;
        let detector = SileroDetector::builder()
            .sample_rate(MODEL_SAMPLE_RATE as i32)
            .chunk_size(chunk_size)
            .build()
            .map_err(|e| ParleyError::VadError(format!("Failed to create VAD: {:?}", e)))?;

        Ok(Self {
            detector,
            chunk_size,
            threshold: threshold.clamp(0.0, 1.0),
        })
    }
}

impl SpeechScorer for SileroScorer {
    fn speech_seconds(&mut self, samples: &[f32]) -> Result<f32> {
        // Windows are scored independently
        self.detector.reset();

        let mut speech_chunks = 0usize;
        for chunk in samples.chunks(self.chunk_size) {
            let probability = self.detector.predict(chunk.iter().copied());
            if probability >= self.threshold {
                speech_chunks += 1;
            }
        }
        Ok((speech_chunks * self.chunk_size) as f32 / MODEL_SAMPLE_RATE as f32)
    }
}

/// RMS gate over 30 ms frames, used when the neural model is unavailable
pub struct EnergyScorer {
    rms_threshold: f32,
    frame_size: usize,
}

impl EnergyScorer {
    pub fn new(rms_threshold: f32) -> Self {
        Self {
            rms_threshold,
            frame_size: 480,
        }
    }

    fn is_voice_frame(&self, frame: &[f32]) -> bool {
        if frame.is_empty() {
            return false;
        }
        let mean_sq = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
        mean_sq.sqrt() > self.rms_threshold
    }
}

impl Default for EnergyScorer {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl SpeechScorer for EnergyScorer {
    fn speech_seconds(&mut self, samples: &[f32]) -> Result<f32> {
        let voiced: usize = samples
            .chunks(self.frame_size)
            .filter(|frame| self.is_voice_frame(frame))
            .map(<[f32]>::len)
            .sum();
        Ok(voiced as f32 / MODEL_SAMPLE_RATE as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_scorer_counts_loud_frames() {
        let mut scorer = EnergyScorer::default();
        let mut window = vec![0.0f32; 8000];
        window.extend(vec![0.5f32; 8000]);

        let score = scorer.speech_seconds(&window).unwrap();
        assert!((score - 0.5).abs() < 0.05);
        assert_eq!(scorer.speech_seconds(&vec![0.0; 16000]).unwrap(), 0.0);
    }

    #[test]
    fn test_silero_silence() {
        if let Ok(mut scorer) = SileroScorer::new(0.5) {
            let score = scorer.speech_seconds(&vec![0.0; 16000]).unwrap();
            assert!(score < 0.1);
        }
    }
}

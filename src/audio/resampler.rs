use crate::{ParleyError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Mono sinc resampler between two fixed rates
pub struct AudioResampler {
    resampler: SincFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
}

impl AudioResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 {
            return Err(ParleyError::ConfigError(
                "Sample rates must be greater than 0".into(),
            ));
        }

        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            2.0,
            params,
            1024,
            1,
        )
        .map_err(|e| {
            ParleyError::AudioProcessingError(format!("Failed to create resampler: {}", e))
        })?;

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
        })
    }

    /// Resample a whole buffer, zero-padding the final block
    pub fn resample(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        let block = self.resampler.input_frames_max();
        let ratio = self.output_rate as f64 / self.input_rate as f64;
        let expected = (input.len() as f64 * ratio).round() as usize;
        let mut output = Vec::with_capacity(expected + block);

        for chunk in input.chunks(block) {
            let mut planar = vec![vec![0.0f32; block]];
            planar[0][..chunk.len()].copy_from_slice(chunk);

            let produced = self
                .resampler
                .process(&planar, None)
                .map_err(|e| ParleyError::AudioProcessingError(format!("Resampling failed: {}", e)))?;

            let take = if chunk.len() < block {
                ((chunk.len() as f64) * ratio).ceil() as usize
            } else {
                produced[0].len()
            };
            output.extend_from_slice(&produced[0][..take.min(produced[0].len())]);
        }

        output.truncate(expected);
        debug!(
            "Resampled {} -> {} samples ({} Hz -> {} Hz)",
            input.len(),
            output.len(),
            self.input_rate,
            self.output_rate
        );
        Ok(output)
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn reset(&mut self) {
        self.resampler.reset();
    }
}

/// One-shot resample; identical rates return the input unchanged
pub fn resample_audio(input: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>> {
    if input_rate == output_rate {
        return Ok(input.to_vec());
    }
    let mut resampler = AudioResampler::new(input_rate, output_rate)?;
    resampler.resample(input)
}

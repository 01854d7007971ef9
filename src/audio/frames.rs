/// Slices a stream of samples into fixed-size playback frames.
///
/// Whatever does not fill a whole frame stays in the remainder until more
/// samples arrive or the caller flushes it.
pub struct FrameSlicer {
    frame_len: usize,
    remainder: Vec<f32>,
}

impl FrameSlicer {
    pub fn new(frame_len: usize) -> Self {
        Self {
            frame_len: frame_len.max(1),
            remainder: Vec::new(),
        }
    }

    /// Append samples and return every complete frame
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.remainder.extend_from_slice(samples);
        let whole = self.remainder.len() / self.frame_len * self.frame_len;
        if whole == 0 {
            return Vec::new();
        }
        let rest = self.remainder.split_off(whole);
        let frames = self
            .remainder
            .chunks(self.frame_len)
            .map(<[f32]>::to_vec)
            .collect();
        self.remainder = rest;
        frames
    }

    /// Zero-pad the remainder into one last frame, if there is one
    pub fn flush(&mut self) -> Option<Vec<f32>> {
        if self.remainder.is_empty() {
            return None;
        }
        let mut frame = std::mem::take(&mut self.remainder);
        frame.resize(self.frame_len, 0.0);
        Some(frame)
    }

    pub fn pending(&self) -> usize {
        self.remainder.len()
    }

    pub fn clear(&mut self) {
        self.remainder.clear();
    }
}

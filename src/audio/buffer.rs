use ringbuf::{traits::*, HeapRb};

/// Fixed-capacity window of the most recent samples.
///
/// Pushing past capacity evicts the oldest samples, so after enough input
/// the buffer always holds exactly the last `capacity` samples.
pub struct AudioRingBuffer {
    ring: HeapRb<f32>,
}

impl AudioRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
        }
    }

    /// Append samples, evicting the oldest on overflow
    pub fn push_slice(&mut self, samples: &[f32]) {
        for &sample in samples {
            if self.ring.try_push(sample).is_err() {
                let _ = self.ring.try_pop();
                let _ = self.ring.try_push(sample);
            }
        }
    }

    /// Copy of the current window, oldest first
    pub fn snapshot(&self) -> Vec<f32> {
        self.ring.iter().copied().collect()
    }

    /// Copy of the last `count` samples
    pub fn tail(&self, count: usize) -> Vec<f32> {
        let len = self.ring.occupied_len();
        self.ring.iter().skip(len.saturating_sub(count)).copied().collect()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_snapshot() {
        let mut buffer = AudioRingBuffer::new(8);
        buffer.push_slice(&[1.0, 2.0, 3.0]);
        assert!(!buffer.is_full());
        assert_eq!(buffer.snapshot(), vec![1.0, 2.0, 3.0]);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_overflow_keeps_latest() {
        let mut buffer = AudioRingBuffer::new(4);
        let data: Vec<f32> = (0..10).map(|i| i as f32).collect();
        buffer.push_slice(&data);

        assert!(buffer.is_full());
        assert_eq!(buffer.snapshot(), vec![6.0, 7.0, 8.0, 9.0]);
        assert_eq!(buffer.tail(2), vec![8.0, 9.0]);
        assert_eq!(buffer.tail(100).len(), 4);
    }

    #[test]
    fn test_clear() {
        let mut buffer = AudioRingBuffer::new(4);
        buffer.push_slice(&[0.5; 4]);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 4);
    }
}

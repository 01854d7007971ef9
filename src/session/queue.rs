use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Bounded FIFO that evicts the oldest item instead of rejecting new ones
pub struct DropOldestQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Push, evicting the oldest item while full. Returns how many were dropped.
    pub fn push(&self, item: T) -> usize {
        let mut dropped = 0;
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return dropped,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if self.rx.try_recv().is_ok() {
                        dropped += 1;
                    }
                }
                // Both ends live in self
                Err(TrySendError::Disconnected(_)) => return dropped,
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = DropOldestQueue::new(2);
        assert_eq!(queue.push(1), 0);
        assert_eq!(queue.push(2), 0);
        assert_eq!(queue.push(3), 1);
        assert_eq!(queue.drain(), vec![2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear_counts() {
        let queue = DropOldestQueue::new(4);
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.pop(), None);
    }
}

//! Dual-trigger batch buffer.
//!
//! ```text
//!   push ─▶ [m1 m2 m3 ...]  ──len == size──────────▶ flush
//!             │
//!             └─ first arrival + interval elapsed ─▶ flush (partial)
//! ```
//!
//! The buffer never reads a clock itself; callers pass `now`, which keeps
//! both triggers deterministic under test.

use std::time::Duration;

use tokio::time::Instant;

/// Buffer flushed by size or by age of its oldest entry, whichever comes first.
#[derive(Debug)]
pub struct BatchBuffer<T> {
    items: Vec<T>,
    size: usize,
    interval: Duration,
    started: Option<Instant>,
}

impl<T> BatchBuffer<T> {
    pub fn new(size: usize, interval: Duration) -> Self {
        let size = size.max(1);
        Self {
            items: Vec::with_capacity(size),
            size,
            interval,
            started: None,
        }
    }

    /// Add one item; returns the full batch once the size trigger fires.
    pub fn push(&mut self, item: T, now: Instant) -> Option<Vec<T>> {
        if self.items.is_empty() {
            self.started = Some(now);
        }
        self.items.push(item);
        if self.items.len() >= self.size {
            return Some(self.take());
        }
        None
    }

    /// When the interval trigger fires for the current contents.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.started.map(|started| started + self.interval)
    }

    /// Returns the partial batch if the interval has elapsed at `now`.
    pub fn poll_expired(&mut self, now: Instant) -> Option<Vec<T>> {
        match self.deadline() {
            Some(deadline) if now >= deadline && !self.items.is_empty() => Some(self.take()),
            _ => None,
        }
    }

    /// Unconditional flush of whatever is buffered.
    pub fn drain(&mut self) -> Option<Vec<T>> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn take(&mut self) -> Vec<T> {
        self.started = None;
        std::mem::replace(&mut self.items, Vec::with_capacity(self.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = 4;
    const INTERVAL: Duration = Duration::from_secs(5);

    #[test]
    fn test_size_trigger_flushes_once_with_all_items() {
        let start = Instant::now();
        let mut buffer = BatchBuffer::new(SIZE, INTERVAL);

        let mut flushes = Vec::new();
        for i in 0..SIZE {
            let now = start + Duration::from_millis(10 * i as u64);
            if let Some(batch) = buffer.push(i, now) {
                flushes.push(batch);
            }
            assert!(buffer.poll_expired(now).is_none());
        }

        assert_eq!(flushes, vec![vec![0, 1, 2, 3]]);
        assert!(buffer.is_empty());
        assert!(buffer.deadline().is_none());
    }

    #[test]
    fn test_interval_trigger_flushes_partial_set() {
        let start = Instant::now();
        let mut buffer = BatchBuffer::new(SIZE, INTERVAL);

        assert!(buffer.push("a", start).is_none());
        assert!(buffer.push("b", start + Duration::from_secs(1)).is_none());
        assert_eq!(buffer.deadline(), Some(start + INTERVAL));

        assert!(buffer.poll_expired(start + Duration::from_secs(4)).is_none());
        assert_eq!(
            buffer.poll_expired(start + INTERVAL),
            Some(vec!["a", "b"])
        );
        assert!(buffer.poll_expired(start + INTERVAL * 2).is_none());
    }

    #[test]
    fn test_timer_restarts_on_next_arrival() {
        let start = Instant::now();
        let mut buffer = BatchBuffer::new(2, INTERVAL);

        buffer.push(1, start);
        buffer.push(2, start + Duration::from_secs(1));
        assert!(buffer.deadline().is_none());

        let later = start + Duration::from_secs(30);
        buffer.push(3, later);
        assert_eq!(buffer.deadline(), Some(later + INTERVAL));
    }

    #[test]
    fn test_drain() {
        let mut buffer = BatchBuffer::new(SIZE, INTERVAL);
        assert!(buffer.drain().is_none());
        buffer.push(7, Instant::now());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.drain(), Some(vec![7]));
        assert!(buffer.drain().is_none());
    }

    #[test]
    fn test_zero_size_behaves_as_unbatched() {
        let mut buffer = BatchBuffer::new(0, INTERVAL);
        assert_eq!(buffer.push('x', Instant::now()), Some(vec!['x']));
    }
}

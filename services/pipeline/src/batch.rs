//! Size- and age-bounded batch accumulation.
//!
//! The buffer tracks the highest delivery tag it has absorbed so a flush can
//! settle the whole batch with one cumulative acknowledgement. The lock is
//! held only to mutate or inspect the buffer, never across broker or storage
//! I/O.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Items taken out of a [`BatchBuffer`] for flushing
#[derive(Debug)]
pub struct Batch<T> {
    pub items: Vec<T>,
    /// Highest delivery tag that contributed to the batch
    pub last_tag: u64,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

struct State<T> {
    items: Vec<T>,
    started_at: Instant,
    high_watermark: u64,
}

pub struct BatchBuffer<T> {
    batch_size: usize,
    state: Mutex<State<T>>,
}

impl<T> BatchBuffer<T> {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            state: Mutex::new(State {
                items: Vec::with_capacity(batch_size),
                started_at: Instant::now(),
                high_watermark: 0,
            }),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Append one item. Returns true once the buffer holds a full batch.
    pub fn push(&self, item: T, delivery_tag: u64) -> bool {
        self.push_many(std::iter::once(item), delivery_tag)
    }

    /// Append several items from one delivery. Returns true once the buffer
    /// holds a full batch.
    pub fn push_many(&self, items: impl IntoIterator<Item = T>, delivery_tag: u64) -> bool {
        let mut state = self.state.lock();
        if state.items.is_empty() {
            state.started_at = Instant::now();
        }
        state.items.extend(items);
        state.high_watermark = state.high_watermark.max(delivery_tag);
        state.items.len() >= self.batch_size
    }

    /// Remove everything buffered so far, or `None` if the buffer is empty.
    pub fn take(&self) -> Option<Batch<T>> {
        let mut state = self.state.lock();
        if state.items.is_empty() {
            return None;
        }
        let items = std::mem::replace(&mut state.items, Vec::with_capacity(self.batch_size));
        let last_tag = state.high_watermark;
        state.started_at = Instant::now();
        Some(Batch { items, last_tag })
    }

    /// True when a partial batch has been waiting at least `max_age`.
    pub fn is_due(&self, max_age: Duration) -> bool {
        let state = self.state.lock();
        !state.items.is_empty() && state.started_at.elapsed() >= max_age
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_at_batch_size() {
        let buffer = BatchBuffer::new(3);
        assert!(!buffer.push("a", 1));
        assert!(!buffer.push("b", 2));
        assert!(buffer.push("c", 3));

        let batch = buffer.take().unwrap();
        assert_eq!(batch.items, vec!["a", "b", "c"]);
        assert_eq!(batch.last_tag, 3);
        assert!(buffer.take().is_none());
    }

    #[test]
    fn test_push_many_can_overshoot() {
        let buffer = BatchBuffer::new(2);
        assert!(buffer.push_many(vec![1, 2, 3], 7));
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_high_watermark_survives_out_of_order_tags() {
        let buffer = BatchBuffer::new(10);
        buffer.push(1, 5);
        buffer.push(2, 4);
        assert_eq!(buffer.take().unwrap().last_tag, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_only_after_max_age() {
        let buffer = BatchBuffer::new(10);
        let max_age = Duration::from_secs(2);
        assert!(!buffer.is_due(max_age));

        buffer.push(1, 1);
        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(!buffer.is_due(max_age));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(buffer.is_due(max_age));

        buffer.take();
        assert!(!buffer.is_due(max_age));
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_starts_at_first_item() {
        let buffer = BatchBuffer::new(10);
        tokio::time::advance(Duration::from_secs(30)).await;
        buffer.push(1, 1);
        assert!(!buffer.is_due(Duration::from_secs(1)));
    }
}

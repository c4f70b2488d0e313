use parking_lot::Mutex;

/// Hand-off queue between the producer and the consumer.
///
/// The lock is held only for a push or a swap, never while records are
/// processed.
pub struct CompletedQueue<T> {
    items: Mutex<Vec<T>>,
}

impl<T> CompletedQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push(item);
    }

    /// Append a batch in order under a single lock.
    pub fn extend(&self, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }

        let mut items = self.items.lock();
        if items.is_empty() {
            *items = batch;
        } else {
            items.extend(batch);
        }
    }

    /// Swap out everything queued so far. Never blocks on processing.
    pub fn try_dequeue_all(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for CompletedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_dequeue_preserves_order() {
        let q = CompletedQueue::new();
        q.push(1);
        q.extend(vec![2, 3]);
        q.push(4);

        assert_eq!(q.len(), 4);
        assert_eq!(q.try_dequeue_all(), vec![1, 2, 3, 4]);
        assert!(q.is_empty());
        assert!(q.try_dequeue_all().is_empty());
    }

    #[test]
    fn test_cross_thread_handoff() {
        let q = Arc::new(CompletedQueue::new());
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    q.push(i);
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 1000 {
            seen.extend(q.try_dequeue_all());
            std::thread::yield_now();
        }
        producer.join().unwrap();

        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    }
}

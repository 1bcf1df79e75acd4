use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// FIFO of raw MQTT payloads between the MQTT event task (producer)
/// and the processing loop (consumer). Unbounded, never blocks.
#[derive(Clone, Default)]
pub struct ObservationQueue {
    inner: Shared<VecDeque<String>>,
}

impl ObservationQueue {
    pub fn new() -> Self {
        Self { inner: new_state(VecDeque::new()) }
    }

    pub fn put(&self, payload: String) {
        self.inner.lock().push_back(payload);
    }

    /// Non-blocking pop, `None` when empty.
    pub fn try_get(&self) -> Option<String> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = ObservationQueue::new();
        queue.put("a".into());
        queue.put("b".into());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_get().as_deref(), Some("a"));
        assert_eq!(queue.try_get().as_deref(), Some("b"));
        assert!(queue.try_get().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clones_share_storage() {
        let producer = ObservationQueue::new();
        let consumer = producer.clone();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let q = producer.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        q.put(format!("{i}-{j}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(consumer.len(), 100);
    }
}

//! Bounded FIFO with overwrite-oldest semantics
//!
//! Used for every queue in the pipeline: the device readers, the broker
//! listener and the dispatcher all push without ever blocking, and a slow
//! consumer sees the newest data rather than stalling its producer. Eviction
//! of the oldest entry on overflow is deliberate, not an error condition.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A capacity-limited FIFO safe for one producer and one consumer.
///
/// `push` never blocks and never fails; at capacity it drops the oldest entry
/// first. All operations are internally serialized by a single lock held only
/// for the queue manipulation itself.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    /// Metric label, e.g. "broker" or "outbound". Also used in log lines.
    name: &'static str,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            name,
        }
    }

    /// Append a message, evicting the oldest entry if the queue is full.
    pub fn push(&self, msg: T) {
        let mut queue = self.inner.lock().expect("queue lock poisoned");
        if queue.len() == self.capacity {
            queue.pop_front();
            metrics::counter!("queue.evicted_total", "queue" => self.name).increment(1);
        }
        queue.push_back(msg);
        metrics::gauge!("queue.depth", "queue" => self.name).set(queue.len() as f64);
    }

    /// Remove and return the oldest message, or `None` if the queue is empty.
    pub fn pop_front(&self) -> Option<T> {
        let mut queue = self.inner.lock().expect("queue lock poisoned");
        let msg = queue.pop_front();
        if msg.is_some() {
            metrics::gauge!("queue.depth", "queue" => self.name).set(queue.len() as f64);
        }
        msg
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("queue lock poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_preserves_fifo_order() {
        let q = BoundedQueue::new("test", 5);
        q.push(b"a".to_vec());
        q.push(b"b".to_vec());
        q.push(b"c".to_vec());

        assert_eq!(q.pop_front(), Some(b"a".to_vec()));
        assert_eq!(q.pop_front(), Some(b"b".to_vec()));
        assert_eq!(q.pop_front(), Some(b"c".to_vec()));
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        // Capacity 3; push A,B,C,D -> pops must yield B,C,D
        let q = BoundedQueue::new("test", 3);
        q.push(b"A".to_vec());
        q.push(b"B".to_vec());
        q.push(b"C".to_vec());
        q.push(b"D".to_vec());

        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_front(), Some(b"B".to_vec()));
        assert_eq!(q.pop_front(), Some(b"C".to_vec()));
        assert_eq!(q.pop_front(), Some(b"D".to_vec()));
        assert!(q.is_empty());
    }

    #[test]
    fn retains_exactly_the_newest_n_in_order() {
        let q = BoundedQueue::new("test", 4);
        for i in 0u8..20 {
            q.push(vec![i]);
        }
        assert_eq!(q.len(), 4);
        for i in 16u8..20 {
            assert_eq!(q.pop_front(), Some(vec![i]));
        }
    }

    #[test]
    fn pop_on_empty_is_none_and_cheap() {
        let q: BoundedQueue<Vec<u8>> = BoundedQueue::new("test", 2);
        assert!(q.is_empty());
        assert_eq!(q.pop_front(), None);
        q.push(b"x".to_vec());
        assert!(!q.is_empty());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn concurrent_producer_consumer() {
        use std::sync::Arc;

        let q = Arc::new(BoundedQueue::new("test", 8));
        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                for i in 0u16..1000 {
                    q.push(i.to_be_bytes().to_vec());
                }
            })
        };

        let consumer = {
            let q = q.clone();
            std::thread::spawn(move || {
                let mut last: Option<u16> = None;
                let mut seen = 0usize;
                while seen < 100 {
                    if let Some(bytes) = q.pop_front() {
                        let v = u16::from_be_bytes([bytes[0], bytes[1]]);
                        // Values may be skipped (evicted) but never reordered
                        if let Some(prev) = last {
                            assert!(v > prev, "out of order: {prev} then {v}");
                        }
                        last = Some(v);
                        seen += 1;
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        assert!(q.len() <= 8);
    }
}

//! Bounded handoff queue shared through the switchboard.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// FIFO with a fixed capacity. Producers block while it is full, consumers
/// while it is empty.
#[derive(Debug)]
pub struct WorkQueue<E> {
    items: Mutex<VecDeque<E>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<E> WorkQueue<E> {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Inspect the head without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(Option<&E>) -> R) -> R {
        f(self.items.lock().front())
    }

    /// Append, blocking while the queue is full.
    pub fn enqueue(&self, item: E) {
        let mut items = self.items.lock();
        while items.len() >= self.capacity {
            self.not_full.wait(&mut items);
        }
        items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Append unless full; a full queue hands the item back.
    pub fn try_enqueue(&self, item: E) -> Result<(), E> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the head, blocking while the queue is empty.
    pub fn dequeue(&self) -> E {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                self.not_full.notify_one();
                return item;
            }
            self.not_empty.wait(&mut items);
        }
    }

    /// Take the head, waiting at most `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<E> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if self.not_empty.wait_until(&mut items, deadline).timed_out() {
                let item = items.pop_front();
                if item.is_some() {
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }
}

impl<E: Clone> WorkQueue<E> {
    pub fn peek(&self) -> Option<E> {
        self.peek_with(|head| head.cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_and_peek() {
        let q = WorkQueue::new(4);
        assert_eq!(q.peek(), None);
        q.enqueue(1);
        q.enqueue(2);
        assert_eq!(q.peek(), Some(1));
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue(), 1);
        assert_eq!(q.dequeue(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_try_enqueue_when_full() {
        let q = WorkQueue::new(1);
        assert!(q.try_enqueue("a").is_ok());
        assert_eq!(q.try_enqueue("b"), Err("b"));
    }

    #[test]
    fn test_dequeue_timeout() {
        let q: WorkQueue<u32> = WorkQueue::new(1);
        let start = Instant::now();
        assert_eq!(q.dequeue_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_enqueue_blocks_until_space() {
        let q = Arc::new(WorkQueue::new(1));
        q.enqueue(1);
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.enqueue(2))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue(), 1);
        producer.join().unwrap();
        assert_eq!(q.dequeue_timeout(Duration::from_secs(5)), Some(2));
    }

    #[test]
    fn test_dequeue_wakes_on_enqueue() {
        let q = Arc::new(WorkQueue::new(2));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.dequeue())
        };
        thread::sleep(Duration::from_millis(20));
        q.enqueue("job");
        assert_eq!(consumer.join().unwrap(), "job");
    }
}

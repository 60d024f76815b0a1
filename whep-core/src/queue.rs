use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// A bounded fan-out queue that drops the *oldest* entry on overflow rather
/// than rejecting the newest one or blocking the pusher: a single slow peer
/// must not stall ingress or other peers.
pub struct DropOldestQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        DropOldestQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue `item`, evicting the oldest queued item first if already at
    /// capacity. Never blocks.
    pub fn push(&self, item: T) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    /// Wait for and pop the next queued item.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod queue_test {
    use super::*;

    #[test]
    fn evicts_oldest_on_overflow() {
        let q: DropOldestQueue<u32> = DropOldestQueue::new(2);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
    }

    #[tokio::test]
    async fn pop_waits_for_an_item() {
        let q = std::sync::Arc::new(DropOldestQueue::<u32>::new(4));
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::task::yield_now().await;
        q.push(7);
        assert_eq!(handle.await.unwrap(), 7);
    }
}

//! FIFO of task ids ready to be handed to a worker.
//!
//! Sends never block: reclamation runs on a timer and must not deadlock
//! against task submission, so an enqueue that would overflow the queue is
//! dropped instead (the reclaimer re-offers the id on its next tick).
//! Receives block until an id arrives or the queue is closed for shutdown.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Semaphore;

use super::task::TaskId;

#[derive(Debug)]
pub struct DispatchQueue {
    inner: Mutex<Inner>,
    /// Counts ids currently queued; closing it releases blocked receivers.
    ready: Semaphore,
}

#[derive(Debug)]
struct Inner {
    ids: VecDeque<TaskId>,
    capacity: usize,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { ids: VecDeque::with_capacity(capacity), capacity }),
            ready: Semaphore::new(0),
        }
    }

    /// Non-blocking send. Returns `false` when the queue is closed or full;
    /// the caller may retry later (reclamation does, every tick).
    pub fn enqueue(&self, id: TaskId) -> bool {
        if self.ready.is_closed() {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.ids.len() >= inner.capacity {
            return false;
        }
        inner.ids.push_back(id);
        self.ready.add_permits(1);
        true
    }

    /// Blocking receive. Returns `None` once the queue has been closed,
    /// which tells the caller the job is over.
    pub async fn dequeue(&self) -> Option<TaskId> {
        loop {
            match self.ready.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    if let Some(id) = self.inner.lock().unwrap().ids.pop_front() {
                        return Some(id);
                    }
                    // A reload swept the backlog out from under this permit;
                    // go back to waiting.
                }
                Err(_) => return None,
            }
        }
    }

    /// Atomically replace the queue contents at a phase boundary. Blocked
    /// receivers wake up against the new batch rather than hanging on the
    /// drained one.
    pub fn reload(&self, ids: impl IntoIterator<Item = TaskId>, capacity: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.ids.clear();
        while let Ok(permit) = self.ready.try_acquire() {
            permit.forget();
        }
        inner.ids.extend(ids);
        inner.capacity = capacity.max(inner.ids.len());
        self.ready.add_permits(inner.ids.len());
    }

    /// Close the queue; every pending and future `dequeue` yields `None`.
    pub fn close(&self) {
        self.ready.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn dequeues_in_fifo_order() {
        let queue = DispatchQueue::new(4);
        assert!(queue.enqueue(3));
        assert!(queue.enqueue(1));
        assert!(queue.enqueue(2));
        assert_eq!(queue.dequeue().await, Some(3));
        assert_eq!(queue.dequeue().await, Some(1));
        assert_eq!(queue.dequeue().await, Some(2));
    }

    #[tokio::test]
    async fn enqueue_drops_on_overflow() {
        let queue = DispatchQueue::new(2);
        assert!(queue.enqueue(0));
        assert!(queue.enqueue(1));
        assert!(!queue.enqueue(2));
        queue.dequeue().await;
        assert!(queue.enqueue(2));
    }

    #[tokio::test]
    async fn blocked_receiver_wakes_on_enqueue() {
        let queue = Arc::new(DispatchQueue::new(2));
        let receiver = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.enqueue(7));
        assert_eq!(receiver.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn close_releases_receivers_and_rejects_sends() {
        let queue = Arc::new(DispatchQueue::new(2));
        let receiver = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert_eq!(receiver.await.unwrap(), None);
        assert!(!queue.enqueue(0));
        assert_eq!(queue.dequeue().await, None);
    }

    #[tokio::test]
    async fn reload_replaces_backlog_and_wakes_receivers() {
        let queue = Arc::new(DispatchQueue::new(4));
        assert!(queue.enqueue(0));
        assert!(queue.enqueue(1));

        queue.reload([9], 4);
        assert_eq!(queue.dequeue().await, Some(9));
        // The pre-reload backlog is gone.
        assert!(timeout(Duration::from_millis(50), queue.dequeue()).await.is_err());

        let receiver = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.reload([4, 5], 4);
        assert_eq!(receiver.await.unwrap(), Some(4));
        assert_eq!(queue.dequeue().await, Some(5));
    }
}

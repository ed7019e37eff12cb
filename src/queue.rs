//! Bounded in-memory FIFO work queue.
//!
//! A thin wrapper over a Tokio MPSC channel: multiple producers submit work,
//! a fixed set of pool workers pull from the shared receiver. The bounded
//! buffer is the backpressure mechanism — when a provider's queue is full,
//! producers block on [`TaskQueue::push_timeout`] until space frees up or
//! the timeout elapses.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::trace;

/// Why a bounded push did not enqueue its item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// All receivers are gone; the queue will never drain again.
    Closed,
    /// The queue stayed full for the whole timeout. The item was consumed
    /// by the abandoned send and is dropped.
    Timeout,
}

/// Bounded FIFO queue shared between producers and a worker group.
pub struct TaskQueue<T>
where
    T: Send + 'static,
{
    /// The receiver wrapped for shared access across workers
    receiver: Arc<Mutex<mpsc::Receiver<T>>>,
    /// The sender for pushing items
    sender: mpsc::Sender<T>,
}

impl<T> TaskQueue<T>
where
    T: Send + 'static,
{
    /// Create a queue with the given buffer capacity. Producers block once
    /// `capacity` items are waiting.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            receiver: Arc::new(Mutex::new(receiver)),
            sender,
        }
    }

    /// Pull the next item in FIFO order. Blocks until an item is available;
    /// returns `None` once the queue is closed and drained.
    pub async fn pull(&self) -> Option<T> {
        let mut receiver = self.receiver.lock().await;
        let result = receiver.recv().await;
        trace!(has_item = result.is_some(), "Pulled item from task queue");
        result
    }

    /// Push an item, waiting up to `timeout` for queue space.
    pub async fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), PushError> {
        match tokio::time::timeout(timeout, self.sender.send(item)).await {
            Ok(Ok(())) => {
                trace!("Pushed item to task queue");
                Ok(())
            }
            Ok(Err(mpsc::error::SendError(_))) => Err(PushError::Closed),
            Err(_) => Err(PushError::Timeout),
        }
    }

    /// Push without blocking; fails immediately when full or closed.
    pub fn try_push(&self, item: T) -> Result<(), mpsc::error::TrySendError<T>> {
        self.sender.try_send(item)
    }

    /// Approximate number of queued items.
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}

impl<T> Clone for TaskQueue<T>
where
    T: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            sender: self.sender.clone(),
        }
    }
}

//! The shared task queue between the producer and the worker pool
//!
//! This is the one data structure the engine requires a thread-safe
//! contract from: concurrent enqueue/dequeue, a length the producer can
//! observe for backpressure, and a dequeue timeout so idle workers can
//! notice the shutdown signal.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::engine::Request;

/// Sink receiving tasks that exceeded their retry budget.
pub type DeadLetterSink = Box<dyn Fn(Request) + Send + Sync>;

/// Unbounded MPMC queue with an observable length and timed dequeue.
///
/// Bounding is enforced by the producer (it throttles itself against
/// [`len`](TaskQueue::len)), not by the queue, so workers re-enqueueing
/// follow-up tasks can never deadlock against a full buffer.
pub struct TaskQueue {
    inner: Mutex<VecDeque<Request>>,
    notify: Notify,
    dead_letter: Option<DeadLetterSink>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dead_letter: None,
        }
    }

    /// Attach a dead-letter sink for over-retried tasks.
    pub fn with_dead_letter(mut self, sink: DeadLetterSink) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    pub fn push(&self, request: Request) {
        self.inner.lock().push_back(request);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Dequeue one task, waiting up to `timeout` for one to arrive.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Request> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(request) = self.inner.lock().pop_front() {
                return Some(request);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            // A missed notification just means another pass over the deque.
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
            if Instant::now() >= deadline {
                return self.inner.lock().pop_front();
            }
        }
    }

    /// Route a task that exceeded its retry budget.
    ///
    /// When a dead-letter sink is attached the task's retry counter is reset
    /// and it is handed over rather than discarded. Returns whether the task
    /// was rerouted.
    pub fn dead_letter(&self, mut request: Request) -> bool {
        match &self.dead_letter {
            Some(sink) => {
                request.retry = 0;
                sink(request);
                true
            }
            None => false,
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

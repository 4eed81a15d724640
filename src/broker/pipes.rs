//! Point-to-point pipes
//!
//! A pipe is a named, bounded FIFO queue with at most one attached receiver
//! at a time. Senders never block: when the queue is full the oldest
//! message is dropped, preserving liveness at the cost of at-most-once for
//! the backlogged receiver.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerStats;
use crate::envelope::Envelope;

/// Shared state of one named pipe
#[derive(Debug)]
pub(crate) struct Pipe {
    name: String,
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    capacity: usize,
    receiver_attached: AtomicBool,
    closed: AtomicBool,
}

impl Pipe {
    pub(crate) fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            receiver_attached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues an envelope, returning the displaced oldest one on overflow
    pub(crate) fn push(&self, envelope: Envelope) -> Option<Envelope> {
        let dropped = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(envelope);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    pub(crate) fn pop(&self) -> Option<Envelope> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.pop_front()
    }

    pub(crate) fn depth(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Attempts to claim the single receiver slot
    pub(crate) fn try_attach_receiver(&self) -> bool {
        !self.receiver_attached.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn detach_receiver(&self) {
        self.receiver_attached.store(false, Ordering::Release);
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }
}

/// Exclusive receiving end of a pipe
///
/// Dropping the receiver frees the slot so another consumer may attach.
pub struct PipeReceiver {
    pipe: std::sync::Arc<Pipe>,
    stats: std::sync::Arc<BrokerStats>,
}

impl PipeReceiver {
    pub(crate) fn new(pipe: std::sync::Arc<Pipe>, stats: std::sync::Arc<BrokerStats>) -> Self {
        Self { pipe, stats }
    }

    /// The pipe this receiver drains
    #[must_use]
    pub fn pipe_name(&self) -> &str {
        self.pipe.name()
    }

    /// Receives the next live envelope, in global FIFO order
    ///
    /// Envelopes whose TTL elapsed while queued are dropped here, at
    /// dispatch time. Returns `None` once the pipe is closed and drained,
    /// or when the cancellation token fires.
    pub async fn recv(&mut self, cancel: &CancellationToken) -> Option<Envelope> {
        loop {
            let notified = self.pipe.notified();
            while let Some(envelope) = self.pipe.pop() {
                if envelope.is_expired() {
                    self.stats.expired.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        pipe = self.pipe.name(),
                        envelope_id = %envelope.id,
                        "dropping expired envelope at pipe dispatch"
                    );
                    continue;
                }
                return Some(envelope);
            }
            if self.pipe.is_closed() {
                return None;
            }
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = notified => {}
            }
        }
    }
}

impl Drop for PipeReceiver {
    fn drop(&mut self) {
        self.pipe.detach_receiver();
    }
}

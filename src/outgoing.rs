//! Pacing for outgoing chat text.
//!
//! The session hands every [`send`](crate::BncsClient::send) to an
//! [`OutgoingQueue`]. The queue decides when each line goes out and calls the
//! attached [`ReadySink`] for it; the session then frames and transmits it.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::dispatch::Priority;

/// Called by a queue when a line is due to be sent.
pub type ReadySink = Arc<dyn Fn(String) + Send + Sync>;

/// A pluggable chat-text scheduler.
///
/// A queue is attached to at most one connected session at a time. Swapping
/// queues is only allowed while the session is disconnected.
pub trait OutgoingQueue: Send + Sync {
    /// Start delivering due lines to `ready`.
    fn attach(&self, ready: ReadySink);

    /// Stop delivering. Lines still queued are kept until [`clear`](Self::clear).
    fn detach(&self);

    /// Queue `text` at `priority`.
    fn enqueue(&self, text: String, priority: Priority);

    /// Drop every queued line.
    fn clear(&self);

    /// Lines waiting to be sent.
    fn pending(&self) -> usize {
        0
    }
}

/// Passes every line straight through.
#[derive(Default)]
pub struct UnpacedQueue {
    ready: Mutex<Option<ReadySink>>,
}

impl OutgoingQueue for UnpacedQueue {
    fn attach(&self, ready: ReadySink) {
        *self.ready.lock() = Some(ready);
    }

    fn detach(&self) {
        self.ready.lock().take();
    }

    fn enqueue(&self, text: String, priority: Priority) {
        let sink = self.ready.lock().clone();
        match sink {
            Some(sink) => sink(text),
            None => debug!(%priority, "dropping chat text: no session attached"),
        }
    }

    fn clear(&self) {}
}

impl fmt::Debug for UnpacedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnpacedQueue")
            .field("attached", &self.ready.lock().is_some())
            .finish()
    }
}

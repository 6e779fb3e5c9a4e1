//! The bounded inbound-message dispatcher.
//!
//! Network receipt is asynchronous and bursty; engine processing is
//! synchronous and single-file. The dispatcher decouples the two with a
//! capacity-bounded FIFO. When a burst exceeds the bound, the **oldest**
//! messages are discarded first: in a consensus protocol newer RPCs
//! (higher term, higher log index) supersede older ones in relevance, so
//! under overload the node prefers recent state over stale state. This is
//! an explicit lossy backpressure policy, not a delivery guarantee.

use std::collections::VecDeque;
use std::sync::Mutex;

use caravel_core::limits::MAX_PENDING_DEFAULT;
use caravel_raft::Message;
use tokio::sync::Notify;
use tracing::debug;

/// Bounded FIFO between the network and the consensus engine.
///
/// Producers call [`accept`](Self::accept) from any task; the single
/// consumer drains with [`next`](Self::next), parking on
/// [`readable`](Self::readable) when empty.
#[derive(Debug)]
pub struct IncomingDispatcher {
    pending: Mutex<VecDeque<Message>>,
    max_pending: usize,
    readable: Notify,
}

impl Default for IncomingDispatcher {
    fn default() -> Self {
        Self::new(MAX_PENDING_DEFAULT)
    }
}

impl IncomingDispatcher {
    /// Creates a dispatcher bounded at `max_pending` queued messages.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        assert!(max_pending > 0, "dispatcher capacity must be positive");
        Self {
            pending: Mutex::new(VecDeque::with_capacity(max_pending)),
            max_pending,
            readable: Notify::new(),
        }
    }

    /// Returns the capacity bound.
    #[must_use]
    pub const fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Appends a message, evicting from the head when over capacity.
    ///
    /// Never blocks and never fails; overflow is silent data loss of the
    /// oldest pending messages, by policy.
    pub fn accept(&self, message: Message) {
        {
            let mut pending = self.pending.lock().expect("dispatcher lock poisoned");
            pending.push_back(message);
            while pending.len() > self.max_pending {
                let dropped = pending.pop_front();
                debug!(
                    dropped = ?dropped.as_ref().map(Message::term),
                    "inbound queue full, dropping oldest message"
                );
            }
        }
        self.readable.notify_one();
    }

    /// Pops the oldest queued message, or `None` when the queue is empty.
    ///
    /// Non-blocking; callers wanting to wait use [`readable`](Self::readable).
    pub fn next(&self) -> Option<Message> {
        self.pending
            .lock()
            .expect("dispatcher lock poisoned")
            .pop_front()
    }

    /// Returns the number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().expect("dispatcher lock poisoned").len()
    }

    /// Returns true when no messages are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until a message may be available.
    ///
    /// Wakes at least once per [`accept`](Self::accept); the consumer must
    /// still treat [`next`](Self::next) returning `None` as normal.
    pub async fn readable(&self) {
        self.readable.notified().await;
    }
}

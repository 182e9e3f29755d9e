//! Lookup queue — a per-kind FIFO that enforces a single
//! in-flight request downstream, with a paired [`TimeoutWheel`] for requests
//! the downstream adapter can't or won't acknowledge.

use std::collections::VecDeque;
use std::time::Duration;

use crate::message::{SubscriptionMessage, TxId};
use crate::timeout::TimeoutWheel;

/// Outcome of enqueuing an inbound lookup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The queue was empty; forward the request downstream now.
    Forward,
    /// Something is already in flight; the request was queued behind it.
    Queued,
    /// An identical request (by equality) was already queued; nothing to do.
    Duplicate,
}

/// One pending re-emission produced by draining the queue after a result
/// arrives: the next queued message, marked to re-enter as `is_back`.
#[derive(Debug, Clone)]
pub struct Reemit<M> {
    pub message: M,
}

/// Per-lookup-kind state: the FIFO (head = in flight) and its timeout wheel.
#[derive(Debug)]
pub struct LookupQueue<M> {
    queue: VecDeque<M>,
    timeouts: TimeoutWheel,
}

impl<M: SubscriptionMessage + PartialEq> LookupQueue<M> {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { queue: VecDeque::new(), timeouts: TimeoutWheel::new(timeout) }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn timeouts(&mut self) -> &mut TimeoutWheel {
        &mut self.timeouts
    }

    /// Enqueues an inbound lookup request:
    /// not already queued (by equality) → clone and push back; forward only
    /// if it landed at the head (queue was empty beforehand).
    pub fn enqueue(&mut self, message: M) -> Enqueued {
        if self.queue.iter().any(|queued| queued == &message) {
            return Enqueued::Duplicate;
        }
        let was_empty = self.queue.is_empty();
        self.queue.push_back(message);
        if was_empty { Enqueued::Forward } else { Enqueued::Queued }
    }

    /// Arms a timeout for `tx` when the downstream adapter does not support
    /// the matching result kind.
    pub fn arm_timeout(&mut self, tx: TxId) {
        self.timeouts.start(tx);
    }

    /// Handles an inbound result for this kind: removes the timeout
    /// for `original_tx_id`, pops the head, and — if another entry remains —
    /// returns it for re-emission with `is_back = true`.
    pub fn on_result(&mut self, original_tx_id: TxId) -> Option<Reemit<M>> {
        self.timeouts.remove(original_tx_id);
        if self.queue.is_empty() {
            return None;
        }
        self.queue.pop_front();
        self.queue.front().cloned().map(|mut message| {
            message.set_is_back(true);
            Reemit { message }
        })
    }

    /// Drives the timeout wheel once per outbound message. Fired
    /// txs are the caller's responsibility to remove from the head of the
    /// queue and materialize as synthetic results.
    pub fn tick(&mut self, delta: Duration) -> Vec<TxId> {
        self.timeouts.tick(delta)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.timeouts.clear();
    }
}

/// Arms a timeout only when the downstream adapter lacks support for the
/// matching result message type.
pub fn arm_timeout_if_unsupported<M: SubscriptionMessage + PartialEq>(
    queue: &mut LookupQueue<M>,
    tx: TxId,
    supported: bool,
) {
    if !supported {
        queue.arm_timeout(tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Envelope, SecurityLookupMessage};

    fn msg(tx: TxId, query: &str) -> SecurityLookupMessage {
        SecurityLookupMessage { envelope: Envelope::new(tx), query: query.to_owned() }
    }

    #[test]
    fn first_enqueue_forwards() {
        let mut q: LookupQueue<SecurityLookupMessage> = LookupQueue::new(Duration::from_secs(10));
        assert_eq!(q.enqueue(msg(1, "a")), Enqueued::Forward);
    }

    #[test]
    fn subsequent_enqueue_is_queued_then_duplicate_is_rejected() {
        let mut q: LookupQueue<SecurityLookupMessage> = LookupQueue::new(Duration::from_secs(10));
        assert_eq!(q.enqueue(msg(1, "a")), Enqueued::Forward);
        assert_eq!(q.enqueue(msg(2, "b")), Enqueued::Queued);
        assert_eq!(q.enqueue(msg(2, "b")), Enqueued::Duplicate);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn on_result_drains_in_fifo_order() {
        let mut q: LookupQueue<SecurityLookupMessage> = LookupQueue::new(Duration::from_secs(10));
        q.enqueue(msg(1, "a"));
        q.enqueue(msg(2, "b"));
        q.enqueue(msg(3, "c"));

        let reemit = q.on_result(1).expect("should re-emit tx=2");
        assert_eq!(reemit.message.envelope.tx_id, 2);
        assert!(reemit.message.envelope.is_back);

        let reemit = q.on_result(2).expect("should re-emit tx=3");
        assert_eq!(reemit.message.envelope.tx_id, 3);

        assert!(q.on_result(3).is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn on_result_on_empty_queue_is_noop() {
        let mut q: LookupQueue<SecurityLookupMessage> = LookupQueue::new(Duration::from_secs(10));
        assert!(q.on_result(99).is_none());
    }
}

//! Subscription table — keyed maps of `key -> SubscriptionInfo`,
//! generic over the key type `K` and the message type `M`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::message::{SubscriptionMessage, TxId};
use crate::subscriber_set::SubscriberSet;

/// Bookkeeping for one physical subscription, shared between the keyed map
/// and any by-tx index via `Arc`.
#[derive(Debug)]
pub struct SubscriptionInfo<M> {
    /// Canonical subscribe request — a clone of the first subscribe for this key.
    pub message: M,
    /// Every subscribe/unsubscribe request seen for this key, in arrival order.
    pub requests: Vec<M>,
    pub subscribers: SubscriberSet,
    /// True only after a successful positive ack from downstream.
    pub is_subscribed: bool,
}

impl<M: Clone> SubscriptionInfo<M> {
    fn new(message: M) -> Self {
        Self {
            requests: vec![message.clone()],
            message,
            subscribers: SubscriberSet::new(),
            is_subscribed: false,
        }
    }
}

/// Outcome of routing an inbound subscribe through the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// Forward the (possibly first) subscribe downstream.
    pub forward: bool,
    /// This subscribe is a history-only duplicate.
    pub is_history_only: bool,
    /// A positive ack should be synthesized and delivered upstream immediately,
    /// because this is a non-forwarded duplicate of an already-acked subscription.
    pub synthesize_ack: bool,
}

/// Outcome of routing an inbound unsubscribe through the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// No live subscription for this key; `non_exist` reply handling applies.
    NotFound,
    /// Still has other subscribers; nothing forwarded downstream.
    StillSubscribed,
    /// Last subscriber left; forward the physical unsubscribe downstream using
    /// this tx as `original_tx_id`.
    Forward { original_tx_id: TxId },
}

/// Keyed map of `key -> SubscriptionInfo`, generalized over `(K, M)`.
#[derive(Debug, Default)]
pub struct SubscriptionTable<K, M> {
    by_key: HashMap<K, Arc<std::sync::Mutex<SubscriptionInfo<M>>>>,
}

impl<K: Eq + Hash + Clone, M: SubscriptionMessage> SubscriptionTable<K, M> {
    #[must_use]
    pub fn new() -> Self {
        Self { by_key: HashMap::new() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
    }

    /// Locates the shared info handle for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Arc<std::sync::Mutex<SubscriptionInfo<M>>>> {
        self.by_key.get(key).cloned()
    }

    pub fn remove(&mut self, key: &K) {
        self.by_key.remove(key);
    }

    /// Every live info handle, in arbitrary order. Used for reconnect
    /// snapshotting and first-live-entry tagging policies.
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<std::sync::Mutex<SubscriptionInfo<M>>>> {
        self.by_key.values().cloned().collect()
    }

    /// Subscribe path: locate-or-create `info`, add `tx` to its
    /// subscriber set, and decide whether this is the physical first
    /// subscribe, a history-only duplicate, or (when already subscribed)
    /// something that needs a synthesized ack.
    ///
    /// Returns the outcome and the shared info handle so the caller can read
    /// `is_subscribed` / append to `requests` under the same lock.
    pub fn subscribe(
        &mut self,
        key: K,
        tx: TxId,
        request: M,
        support_multiple_subscriptions: bool,
    ) -> (SubscribeOutcome, Arc<std::sync::Mutex<SubscriptionInfo<M>>>) {
        let entry = self
            .by_key
            .entry(key)
            .or_insert_with(|| Arc::new(std::sync::Mutex::new(SubscriptionInfo::new(request.clone()))));
        let handle = Arc::clone(entry);

        let mut info = handle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let is_first = info.subscribers.is_empty();
        info.subscribers.add(tx);

        let outcome = if is_first {
            SubscribeOutcome { forward: true, is_history_only: false, synthesize_ack: false }
        } else if support_multiple_subscriptions {
            SubscribeOutcome { forward: true, is_history_only: true, synthesize_ack: false }
        } else {
            SubscribeOutcome {
                forward: false,
                is_history_only: false,
                synthesize_ack: info.is_subscribed,
            }
        };

        if !is_first {
            info.requests.push(request);
        }
        drop(info);

        (outcome, handle)
    }

    /// Unsubscribe path: locate `info` by key, remove `original_tx_id`
    /// from its subscriber set, and report whether the physical unsubscribe
    /// should be forwarded. Removes the key entry once the set empties.
    pub fn unsubscribe(&mut self, key: &K, original_tx_id: TxId) -> UnsubscribeOutcome {
        let Some(handle) = self.by_key.get(key).cloned() else {
            return UnsubscribeOutcome::NotFound;
        };

        let mut info = handle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if info.subscribers.is_empty() {
            drop(info);
            self.by_key.remove(key);
            return UnsubscribeOutcome::NotFound;
        }

        info.subscribers.remove(original_tx_id);
        let now_empty = info.subscribers.is_empty();
        let message_tx_id = info.message.tx_id();
        drop(info);

        if now_empty {
            self.by_key.remove(key);
            let original_tx_id =
                if original_tx_id != crate::message::NO_TX { original_tx_id } else { message_tx_id };
            UnsubscribeOutcome::Forward { original_tx_id }
        } else {
            UnsubscribeOutcome::StillSubscribed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Envelope, MarketDataType, MdMessage, MdPayload};

    fn key(security_id: u64) -> crate::key::MarketDataKey {
        crate::key::MarketDataKey {
            data_type: MarketDataType::Quote,
            security_id: Some(security_id),
            arg: String::new(),
        }
    }

    fn sub(tx: TxId) -> MdMessage {
        MdMessage {
            envelope: Envelope { tx_id: tx, is_subscribe: true, ..Envelope::default() },
            payload: MdPayload::Security {
                data_type: MarketDataType::Quote,
                security_id: Some(1),
                arg: String::new(),
            },
        }
    }

    #[test]
    fn first_subscribe_forwards() {
        let mut table: SubscriptionTable<crate::key::MarketDataKey, MdMessage> =
            SubscriptionTable::new();
        let (outcome, _) = table.subscribe(key(1), 1, sub(1), false);
        assert!(outcome.forward);
        assert!(!outcome.is_history_only);
    }

    #[test]
    fn second_subscribe_without_multi_support_is_suppressed() {
        let mut table: SubscriptionTable<crate::key::MarketDataKey, MdMessage> =
            SubscriptionTable::new();
        table.subscribe(key(1), 1, sub(1), false);
        let (outcome, handle) = table.subscribe(key(1), 2, sub(2), false);
        assert!(!outcome.forward);
        assert!(!outcome.synthesize_ack); // not yet acked downstream
        assert_eq!(handle.lock().unwrap().subscribers.len(), 2);
    }

    #[test]
    fn second_subscribe_with_multi_support_is_history_only() {
        let mut table: SubscriptionTable<crate::key::MarketDataKey, MdMessage> =
            SubscriptionTable::new();
        table.subscribe(key(1), 1, sub(1), true);
        let (outcome, _) = table.subscribe(key(1), 2, sub(2), true);
        assert!(outcome.forward);
        assert!(outcome.is_history_only);
    }

    #[test]
    fn synthesized_ack_when_already_subscribed() {
        let mut table: SubscriptionTable<crate::key::MarketDataKey, MdMessage> =
            SubscriptionTable::new();
        let (_, handle) = table.subscribe(key(1), 1, sub(1), false);
        handle.lock().unwrap().is_subscribed = true;

        let (outcome, _) = table.subscribe(key(1), 2, sub(2), false);
        assert!(!outcome.forward);
        assert!(outcome.synthesize_ack);
    }

    #[test]
    fn unsubscribe_last_subscriber_forwards_and_removes_key() {
        let mut table: SubscriptionTable<crate::key::MarketDataKey, MdMessage> =
            SubscriptionTable::new();
        table.subscribe(key(1), 1, sub(1), false);
        let outcome = table.unsubscribe(&key(1), 1);
        assert_eq!(outcome, UnsubscribeOutcome::Forward { original_tx_id: 1 });
        assert!(table.is_empty());
    }

    #[test]
    fn unsubscribe_one_of_many_keeps_key() {
        let mut table: SubscriptionTable<crate::key::MarketDataKey, MdMessage> =
            SubscriptionTable::new();
        table.subscribe(key(1), 1, sub(1), true);
        table.subscribe(key(1), 2, sub(2), true);
        let outcome = table.unsubscribe(&key(1), 1);
        assert_eq!(outcome, UnsubscribeOutcome::StillSubscribed);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unsubscribe_unknown_key_is_not_found() {
        let mut table: SubscriptionTable<crate::key::MarketDataKey, MdMessage> =
            SubscriptionTable::new();
        assert_eq!(table.unsubscribe(&key(99), 1), UnsubscribeOutcome::NotFound);
    }
}

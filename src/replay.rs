//! Reconnect replay engine — pure helpers for turning a captured
//! live subscribe into its paired disconnect-time unsubscribe, and for
//! marking a captured subscribe for inbound re-emission on reconnect.
//!
//! The actual snapshot capture walks the router's subscription tables, so it
//! lives on [`crate::router::Router`]; this module only holds the
//! message-shape transforms, which are independent of which table a
//! subscribe came from.

use crate::message::{Message, TxId};

/// Turns a captured subscribe into its paired unsubscribe: fresh `tx_id`,
/// `original_tx_id` set to the captured tx, `is_subscribe` cleared.
#[must_use]
pub fn to_disconnect_unsubscribe(mut captured: Message, fresh_tx: TxId) -> Message {
    if let Some(envelope) = captured.envelope_mut() {
        let original = envelope.tx_id;
        envelope.tx_id = fresh_tx;
        envelope.original_tx_id = original;
        envelope.is_subscribe = false;
    }
    captured
}

/// Marks a captured subscribe for re-emission through the inbound port on
/// reconnect.
#[must_use]
pub fn mark_for_replay(mut captured: Message) -> Message {
    if let Some(envelope) = captured.envelope_mut() {
        envelope.is_back = true;
    }
    captured
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Envelope, MarketDataType, MdMessage, MdPayload};

    fn subscribe(tx: TxId) -> Message {
        Message::MarketData(MdMessage {
            envelope: Envelope { tx_id: tx, is_subscribe: true, ..Envelope::default() },
            payload: MdPayload::Security {
                data_type: MarketDataType::Quote,
                security_id: Some(1),
                arg: String::new(),
            },
        })
    }

    #[test]
    fn disconnect_unsubscribe_carries_captured_tx_as_original() {
        let unsub = to_disconnect_unsubscribe(subscribe(10), 99);
        let env = unsub.envelope().expect("has envelope");
        assert_eq!(env.tx_id, 99);
        assert_eq!(env.original_tx_id, 10);
        assert!(!env.is_subscribe);
    }

    #[test]
    fn replay_mark_sets_is_back() {
        let replayed = mark_for_replay(subscribe(10));
        assert!(replayed.envelope().expect("has envelope").is_back);
    }
}

//! Scenario-level coverage of the subscription router: dedup, unsubscribe
//! correlation, lookup serialization, timeouts, reconnect replay, and
//! outbound subscriber tagging.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use venue_subscription_router::adapter::{DownstreamAdapter, UpstreamSink};
use venue_subscription_router::config::RouterConfig;
use venue_subscription_router::message::{
    AckMessage, Envelope, MarketDataType, MdMessage, MdPayload, Message, NO_TX,
    PortfolioLookupMessage, PortfolioMessage,
};
use venue_subscription_router::router::Router;

/// Records everything forwarded to the venue transport; never actually talks
/// to one.
#[derive(Default)]
struct RecordingDownstream {
    sent: Mutex<Vec<Message>>,
    next_tx: Mutex<u64>,
    supports: Mutex<Vec<&'static str>>,
    support_by_security: bool,
}

impl RecordingDownstream {
    fn new() -> Self {
        Self { next_tx: Mutex::new(1000), support_by_security: true, ..Self::default() }
    }

    fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(Message::kind_name).collect()
    }

    fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

impl DownstreamAdapter for RecordingDownstream {
    fn send_in(&self, message: Message) {
        self.sent.lock().unwrap().push(message);
    }

    fn supports_out(&self, kind: &str) -> bool {
        self.supports.lock().unwrap().contains(&kind)
    }

    fn next_tx_id(&self) -> u64 {
        let mut next = self.next_tx.lock().unwrap();
        let tx = *next;
        *next += 1;
        tx
    }

    fn is_support_subscription_by_security(&self) -> bool {
        self.support_by_security
    }
}

/// Records everything raised to the client, and replays `on_send_in` calls
/// straight back into the router it is bound to (mirroring how an embedder
/// wires reconnect replay back through its own inbound port).
#[derive(Default)]
struct RecordingUpstream {
    raised: Mutex<Vec<Message>>,
    router: Mutex<Option<Arc<Router>>>,
}

impl RecordingUpstream {
    fn bind(&self, router: Arc<Router>) {
        *self.router.lock().unwrap() = Some(router);
    }

    fn raised_kinds(&self) -> Vec<&'static str> {
        self.raised.lock().unwrap().iter().map(Message::kind_name).collect()
    }

    fn take_raised(&self) -> Vec<Message> {
        std::mem::take(&mut self.raised.lock().unwrap())
    }
}

impl UpstreamSink for RecordingUpstream {
    fn raise_new_out(&self, message: Message) {
        self.raised.lock().unwrap().push(message);
    }

    fn on_send_in(&self, message: Message) {
        if let Some(router) = self.router.lock().unwrap().as_ref() {
            router.send_in(message);
        }
    }
}

fn security_subscribe(tx: u64, security_id: u64) -> Message {
    Message::MarketData(MdMessage {
        envelope: Envelope { tx_id: tx, is_subscribe: true, ..Envelope::default() },
        payload: MdPayload::Security {
            data_type: MarketDataType::Quote,
            security_id: Some(security_id),
            arg: String::new(),
        },
    })
}

fn security_unsubscribe(tx: u64, original_tx_id: u64, security_id: u64) -> Message {
    Message::MarketData(MdMessage {
        envelope: Envelope {
            tx_id: tx,
            original_tx_id,
            is_subscribe: false,
            ..Envelope::default()
        },
        payload: MdPayload::Security {
            data_type: MarketDataType::Quote,
            security_id: Some(security_id),
            arg: String::new(),
        },
    })
}

fn wire() -> (Arc<Router>, Arc<RecordingDownstream>, Arc<RecordingUpstream>) {
    let downstream = Arc::new(RecordingDownstream::new());
    let upstream = Arc::new(RecordingUpstream::default());
    let router =
        Arc::new(Router::new(RouterConfig::default(), downstream.clone(), upstream.clone()));
    upstream.bind(Arc::clone(&router));
    (router, downstream, upstream)
}

#[test]
fn duplicate_subscribe_to_same_key_is_collapsed() {
    let (router, downstream, upstream) = wire();

    router.send_in(security_subscribe(1, 42));
    assert_eq!(downstream.take_sent().len(), 1);

    // The venue acks the physical subscribe before the second logical
    // subscriber arrives.
    router.handle_out(Message::MarketDataAck(AckMessage {
        envelope: Envelope { original_tx_id: 1, ..Envelope::default() },
    }));
    upstream.take_raised();

    router.send_in(security_subscribe(2, 42));

    // No second physical subscribe goes downstream; the new logical
    // subscriber gets a synthesized positive ack instead.
    assert!(downstream.take_sent().is_empty());
    assert_eq!(upstream.raised_kinds(), vec!["MarketDataAck"]);

    let ack = upstream.take_raised().remove(0);
    assert_eq!(ack.original_tx_id(), 2);
}

#[test]
fn last_subscriber_leaving_forwards_the_unsubscribe() {
    let (router, downstream, _upstream) = wire();

    router.send_in(security_subscribe(1, 42));
    downstream.take_sent();

    router.send_in(security_subscribe(2, 42));
    assert!(downstream.take_sent().is_empty());

    router.send_in(security_unsubscribe(3, 1, 42));
    assert!(downstream.take_sent().is_empty(), "one subscriber remains");

    router.send_in(security_unsubscribe(4, 2, 42));
    let sent = downstream.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].tx_id(), 4);
    assert_eq!(sent[0].original_tx_id(), 2);
}

#[test]
fn unsubscribe_for_unknown_key_replies_with_error_when_configured() {
    let downstream = Arc::new(RecordingDownstream::new());
    let upstream = Arc::new(RecordingUpstream::default());
    let config = RouterConfig::default().with_non_exist_subscription_as_error(true);
    let router = Arc::new(Router::new(config, downstream.clone(), upstream.clone()));
    upstream.bind(Arc::clone(&router));

    router.send_in(security_unsubscribe(1, NO_TX, 42));

    assert!(downstream.take_sent().is_empty());
    let raised = upstream.take_raised();
    assert_eq!(raised.len(), 1);
    match &raised[0] {
        Message::MarketDataAck(ack) => {
            assert!(ack.envelope.error.is_some());
            assert_eq!(ack.envelope.original_tx_id, 1);
        }
        other => panic!("expected MarketDataAck, got {other:?}"),
    }
}

#[test]
fn execution_stream_is_tagged_with_live_portfolio_lookup_subscriber() {
    let (router, downstream, upstream) = wire();

    router.send_in(Message::PortfolioLookup(PortfolioLookupMessage {
        envelope: Envelope { tx_id: 7, is_subscribe: true, ..Envelope::default() },
        name: "main".to_owned(),
    }));
    downstream.take_sent();

    router.handle_out(Message::Execution(venue_subscription_router::message::DataMessage {
        envelope: Envelope { original_tx_id: 7, ..Envelope::default() },
    }));

    let raised = upstream.take_raised();
    assert_eq!(raised.len(), 1);
    match &raised[0] {
        Message::Execution(data) => {
            assert_eq!(data.envelope.subscription_id, 7);
            assert_eq!(&*data.envelope.subscription_ids, &[7]);
        }
        other => panic!("expected Execution, got {other:?}"),
    }
}

#[test]
fn portfolio_heartbeat_is_tagged_and_refreshes_the_lookup_timeout() {
    let (router, downstream, upstream) = wire();

    router.send_in(Message::PortfolioLookup(PortfolioLookupMessage {
        envelope: Envelope { tx_id: 7, is_subscribe: true, ..Envelope::default() },
        name: "main".to_owned(),
    }));
    downstream.take_sent();

    // Heartbeat data carries `original_tx_id`, never `tx_id` (which defaults
    // to `NO_TX` on outbound data messages) — tagging must key off that
    // field, matching every sibling outbound arm.
    router.handle_out(Message::Portfolio(PortfolioMessage {
        envelope: Envelope { original_tx_id: 7, ..Envelope::default() },
        name: "main".to_owned(),
    }));

    let raised = upstream.take_raised();
    assert_eq!(raised.len(), 1);
    match &raised[0] {
        Message::PortfolioData(data) => {
            assert_eq!(data.envelope.subscription_id, 7);
            assert_eq!(&*data.envelope.subscription_ids, &[7]);
        }
        other => panic!("expected PortfolioData, got {other:?}"),
    }
}

#[test]
fn security_lookups_serialize_behind_a_single_in_flight_request() {
    let (router, downstream, _upstream) = wire();

    router.send_in(Message::SecurityLookup(
        venue_subscription_router::message::SecurityLookupMessage {
            envelope: Envelope { tx_id: 1, ..Envelope::default() },
            query: "AAA".to_owned(),
        },
    ));
    router.send_in(Message::SecurityLookup(
        venue_subscription_router::message::SecurityLookupMessage {
            envelope: Envelope { tx_id: 2, ..Envelope::default() },
            query: "BBB".to_owned(),
        },
    ));

    // Only the first lookup goes downstream; the second is queued.
    assert_eq!(downstream.sent_kinds(), vec!["SecurityLookup"]);

    router.handle_out(Message::SecurityLookupResult(AckMessage {
        envelope: Envelope { original_tx_id: 1, ..Envelope::default() },
    }));

    // Resolving the first drains the queue and forwards the second.
    let sent = downstream.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].tx_id(), 2);
}

#[test]
fn unacknowledged_lookup_times_out_without_downstream_support() {
    let (router, downstream, upstream) = wire();

    router.send_in(Message::SecurityLookup(
        venue_subscription_router::message::SecurityLookupMessage {
            envelope: Envelope { tx_id: 1, ..Envelope::default() },
            query: "AAA".to_owned(),
        },
    ));
    assert_eq!(downstream.sent_kinds(), vec!["SecurityLookup"]);

    // First outbound message only seeds `prev_local_time`; nothing times out yet.
    router.handle_out(Message::MarketDataAck(AckMessage {
        envelope: Envelope {
            original_tx_id: 999,
            local_time: Some(Duration::from_secs(100)),
            ..Envelope::default()
        },
    }));
    upstream.take_raised();

    // 11s later (default timeout is 10s): the lookup fires a synthetic result.
    router.handle_out(Message::MarketDataAck(AckMessage {
        envelope: Envelope {
            original_tx_id: 999,
            local_time: Some(Duration::from_secs(111)),
            ..Envelope::default()
        },
    }));

    let raised = upstream.take_raised();
    assert!(raised.iter().any(|m| matches!(m, Message::SecurityLookupResult(_))));
    let result = raised
        .iter()
        .find(|m| matches!(m, Message::SecurityLookupResult(_)))
        .expect("timeout result present");
    assert_eq!(result.original_tx_id(), 1);
}

#[test]
fn disconnect_with_restore_replays_live_subscriptions_on_reconnect() {
    let downstream = Arc::new(RecordingDownstream::new());
    let upstream = Arc::new(RecordingUpstream::default());
    let config = RouterConfig::default().with_restore_on_normal_reconnect(true);
    let router = Arc::new(Router::new(config, downstream.clone(), upstream.clone()));
    upstream.bind(Arc::clone(&router));

    router.send_in(security_subscribe(1, 42));
    downstream.take_sent();

    router.send_in(Message::Disconnect);
    let sent = downstream.take_sent();
    assert!(sent.iter().any(|m| matches!(
        m,
        Message::MarketData(MdMessage { envelope, .. }) if !envelope.is_subscribe
    )));
    assert!(sent.iter().any(|m| matches!(m, Message::Disconnect)));

    router.handle_out(Message::Connect { ok: true });

    let sent = downstream.take_sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Message::MarketData(msg) => {
            assert!(msg.envelope.is_subscribe);
            assert!(msg.envelope.is_back);
        }
        other => panic!("expected replayed MarketData subscribe, got {other:?}"),
    }
}

#[test]
fn disconnect_with_error_restore_preserves_subscriber_tables() {
    let downstream = Arc::new(RecordingDownstream::new());
    let upstream = Arc::new(RecordingUpstream::default());
    let config = RouterConfig::default()
        .with_restore_on_error_reconnect(true)
        .with_restore_on_normal_reconnect(false);
    let router = Arc::new(Router::new(config, downstream.clone(), upstream.clone()));
    upstream.bind(Arc::clone(&router));

    router.send_in(security_subscribe(1, 42));
    downstream.take_sent();

    router.send_in(Message::Disconnect);
    downstream.take_sent();

    // The key's subscriber set must still contain tx=1: a second logical
    // subscriber arriving for the same key is treated as a duplicate (not
    // forwarded), which would only happen if the table survived Disconnect.
    router.send_in(security_subscribe(2, 42));
    assert!(
        downstream.take_sent().is_empty(),
        "subscriber table should have persisted across disconnect"
    );
}

#[test]
fn reset_clears_transient_state_but_forwards_downstream() {
    let (router, downstream, _upstream) = wire();

    router.send_in(Message::Reset);

    assert_eq!(downstream.sent_kinds(), vec!["Reset"]);
}

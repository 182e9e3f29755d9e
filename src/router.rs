//! Message Router — the switch that dispatches each message
//! variant to the subscription table, lookup queue, timeout wheel, and
//! reconnect replay engine, and applies subscription-id tagging on outbound
//! data.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::adapter::{DownstreamAdapter, UpstreamSink};
use crate::config::RouterConfig;
use crate::error::{Kind, RouterError};
use crate::key::{MarketDataKey, normalize_scope};
use crate::lookup::{Enqueued, LookupQueue};
use crate::message::{
    AckMessage, BoardLookupMessage, DataMessage, Envelope, MdMessage, MdPayload, Message, NO_TX,
    OrderStatusMessage, PortfolioLookupMessage, PortfolioMessage, SecurityLookupMessage,
    SubscriberSnapshot, SubscriptionMessage, TimeFrameLookupMessage, TxId,
};
use crate::replay;
use crate::table::{SubscriptionInfo, SubscriptionTable, UnsubscribeOutcome};

type Handle<M> = Arc<Mutex<SubscriptionInfo<M>>>;

/// Which keyed table an `md_by_tx` entry belongs to, so it can be removed
/// from the right place once it's drained.
#[derive(Debug, Clone)]
enum MdKeyRef {
    Security(MarketDataKey),
    NewsBoard(String),
}

struct RouterState {
    md_by_key: SubscriptionTable<MarketDataKey, MdMessage>,
    news_board_by_key: SubscriptionTable<String, MdMessage>,
    portfolio_by_name: SubscriptionTable<String, PortfolioMessage>,
    md_by_tx: HashMap<TxId, (MdKeyRef, Handle<MdMessage>)>,
    order_status_by_tx: SubscriptionTable<TxId, OrderStatusMessage>,
    pf_lookup_by_tx: SubscriptionTable<TxId, PortfolioLookupMessage>,

    history_only_tx: std::collections::HashSet<TxId>,
    pass_through_tx: std::collections::HashSet<TxId>,
    pending_replay: Vec<Message>,
    prev_local_time: Option<Duration>,

    lookups_securities: LookupQueue<SecurityLookupMessage>,
    lookups_portfolios: LookupQueue<PortfolioLookupMessage>,
    lookups_boards: LookupQueue<BoardLookupMessage>,
    lookups_time_frames: LookupQueue<TimeFrameLookupMessage>,
}

impl RouterState {
    fn new(lookup_timeout: Duration) -> Self {
        Self {
            md_by_key: SubscriptionTable::new(),
            news_board_by_key: SubscriptionTable::new(),
            portfolio_by_name: SubscriptionTable::new(),
            md_by_tx: HashMap::new(),
            order_status_by_tx: SubscriptionTable::new(),
            pf_lookup_by_tx: SubscriptionTable::new(),
            history_only_tx: std::collections::HashSet::new(),
            pass_through_tx: std::collections::HashSet::new(),
            pending_replay: Vec::new(),
            prev_local_time: None,
            lookups_securities: LookupQueue::new(lookup_timeout),
            lookups_portfolios: LookupQueue::new(lookup_timeout),
            lookups_boards: LookupQueue::new(lookup_timeout),
            lookups_time_frames: LookupQueue::new(lookup_timeout),
        }
    }

    /// Snapshot of every live subscribe message across all five subscription
    /// tables.
    fn snapshot_subscriptions(&self) -> Vec<Message> {
        let mut out = Vec::new();
        for (_, handle) in self.md_by_tx.values() {
            let info = handle.lock().unwrap_or_else(PoisonError::into_inner);
            out.push(Message::MarketData(info.message.clone()));
        }
        for handle in self.portfolio_by_name_handles() {
            let info = handle.lock().unwrap_or_else(PoisonError::into_inner);
            out.push(Message::Portfolio(info.message.clone()));
        }
        for handle in self.order_status_handles() {
            let info = handle.lock().unwrap_or_else(PoisonError::into_inner);
            out.push(Message::OrderStatus(info.message.clone()));
        }
        for handle in self.pf_lookup_handles() {
            let info = handle.lock().unwrap_or_else(PoisonError::into_inner);
            out.push(Message::PortfolioLookup(info.message.clone()));
        }
        out
    }

    fn portfolio_by_name_handles(&self) -> Vec<Handle<PortfolioMessage>> {
        self.portfolio_by_name.handles()
    }

    fn order_status_handles(&self) -> Vec<Handle<OrderStatusMessage>> {
        self.order_status_by_tx.handles()
    }

    fn pf_lookup_handles(&self) -> Vec<Handle<PortfolioLookupMessage>> {
        self.pf_lookup_by_tx.handles()
    }

    fn clear_subscriber_tables(&mut self) {
        self.md_by_key.clear();
        self.news_board_by_key.clear();
        self.portfolio_by_name.clear();
        self.md_by_tx.clear();
        self.order_status_by_tx.clear();
        self.pf_lookup_by_tx.clear();
    }

    fn clear_transient_state(&mut self) {
        self.pending_replay.clear();
        self.pass_through_tx.clear();
        self.lookups_securities.clear();
        self.lookups_portfolios.clear();
        self.lookups_boards.clear();
        self.lookups_time_frames.clear();
        self.prev_local_time = None;
    }
}

/// Outcome of running the subscription-table side of an inbound subscribe or
/// unsubscribe, shared by every `(K, M)` instantiation the router touches.
enum DispatchOutcome {
    /// Forward the given message downstream as-is.
    Forward(Message),
    /// Drop the inbound message; nothing forwarded downstream.
    Suppress,
    /// Deliver this message upstream instead of forwarding downstream
    /// (a synthesized ack, or a non-exist-subscription reply).
    ReplyUpstream(Message),
}

/// The subscription multiplexing adapter.
///
/// Construct one per downstream connection with a [`DownstreamAdapter`] and
/// [`UpstreamSink`] pair and drive it by calling [`Router::send_in`] for
/// inbound traffic and [`Router::handle_out`] for outbound traffic.
pub struct Router {
    config: RouterConfig,
    downstream: Arc<dyn DownstreamAdapter>,
    upstream: Arc<dyn UpstreamSink>,
    state: Mutex<RouterState>,
}

impl Router {
    #[must_use]
    pub fn new(
        config: RouterConfig,
        downstream: Arc<dyn DownstreamAdapter>,
        upstream: Arc<dyn UpstreamSink>,
    ) -> Self {
        let state = Mutex::new(RouterState::new(config.lookup_timeout()));
        Self { config, downstream, upstream, state }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------- inbound

    /// Entry point for control messages from above: subscribe, unsubscribe,
    /// lookup, and connect-lifecycle traffic.
    pub fn send_in(&self, message: Message) {
        match message {
            Message::Reset => self.on_reset(),
            Message::Disconnect => self.on_disconnect(),
            Message::MarketData(msg) => self.on_market_data(msg),
            Message::Portfolio(msg) => self.on_portfolio(msg),
            Message::OrderStatus(msg) => self.on_order_status(msg),
            Message::PortfolioLookup(msg) => self.on_portfolio_lookup(msg),
            Message::SecurityLookup(msg) => self.on_security_lookup(msg),
            Message::BoardLookup(msg) => self.on_board_lookup(msg),
            Message::TimeFrameLookup(msg) => self.on_time_frame_lookup(msg),
            other => self.downstream.send_in(other),
        }
    }

    fn on_reset(&self) {
        {
            let mut state = self.lock();
            if !self.config.restore_on_error_reconnect {
                state.clear_subscriber_tables();
            }
            state.clear_transient_state();
        }
        tracing::debug!("reset: cleared transient router state");
        self.downstream.send_in(Message::Reset);
    }

    fn on_disconnect(&self) {
        let to_emit = {
            let mut state = self.lock();
            let snapshot = state.snapshot_subscriptions();
            tracing::debug!(count = snapshot.len(), "disconnect: captured live subscriptions");

            if self.config.restore_on_normal_reconnect {
                state.pending_replay.clone_from(&snapshot);
            } else if !self.config.restore_on_error_reconnect {
                state.clear_subscriber_tables();
            }

            let mut to_emit = Vec::with_capacity(snapshot.len());
            for captured in snapshot {
                let fresh_tx = self.downstream.next_tx_id();
                if self.config.restore_on_normal_reconnect {
                    state.pass_through_tx.insert(fresh_tx);
                }
                to_emit.push(replay::to_disconnect_unsubscribe(captured, fresh_tx));
            }
            to_emit
        };

        for unsub in to_emit {
            self.downstream.send_in(unsub);
        }
        self.downstream.send_in(Message::Disconnect);
    }

    fn on_market_data(&self, msg: MdMessage) {
        let tx = msg.envelope.tx_id;

        if self.take_pass_through(tx) {
            self.downstream.send_in(Message::MarketData(msg));
            return;
        }

        let is_subscribe = msg.envelope.is_subscribe;
        let target_tx = if msg.envelope.original_tx_id != NO_TX { msg.envelope.original_tx_id } else { tx };
        let outcome = {
            let mut state = self.lock();
            match &msg.payload {
                MdPayload::Security { .. } => {
                    let key = self.market_data_key(&msg.payload);
                    if is_subscribe {
                        self.dispatch_md_subscribe(&mut state, MdKeyRef::Security(key), msg)
                    } else {
                        self.dispatch_md_unsubscribe(
                            &mut state,
                            &MdKeyRefBorrow::Security(&key),
                            tx,
                            target_tx,
                        )
                    }
                }
                MdPayload::NewsBoard { scope } => {
                    let scope = normalize_scope(scope);
                    if is_subscribe {
                        self.dispatch_md_subscribe(&mut state, MdKeyRef::NewsBoard(scope), msg)
                    } else {
                        self.dispatch_md_unsubscribe(
                            &mut state,
                            &MdKeyRefBorrow::NewsBoard(&scope),
                            tx,
                            target_tx,
                        )
                    }
                }
            }
        };

        self.apply_dispatch_outcome(outcome);
    }

    fn market_data_key(&self, payload: &MdPayload) -> MarketDataKey {
        let MdPayload::Security { data_type, security_id, arg } = payload else {
            unreachable!("called only for MdPayload::Security");
        };
        let security_id =
            if self.downstream.is_support_subscription_by_security() { *security_id } else { None };
        MarketDataKey { data_type: *data_type, security_id, arg: arg.clone() }
    }

    fn dispatch_md_subscribe(
        &self,
        state: &mut RouterState,
        key_ref: MdKeyRef,
        msg: MdMessage,
    ) -> DispatchOutcome {
        let tx = msg.envelope.tx_id;
        let (outcome, handle) = match &key_ref {
            MdKeyRef::Security(key) => state.md_by_key.subscribe(
                key.clone(),
                tx,
                msg.clone(),
                self.config.support_multiple_subscriptions,
            ),
            MdKeyRef::NewsBoard(scope) => state.news_board_by_key.subscribe(
                scope.clone(),
                tx,
                msg.clone(),
                self.config.support_multiple_subscriptions,
            ),
        };

        state.md_by_tx.insert(tx, (key_ref, handle));

        if outcome.is_history_only {
            state.history_only_tx.insert(tx);
            tracing::debug!(tx, "market data subscribe accepted as history-only");
        } else {
            tracing::debug!(tx, forward = outcome.forward, "market data subscribe dispatched");
        }

        if outcome.forward {
            let mut forwarded = msg;
            forwarded.envelope.is_history = outcome.is_history_only;
            DispatchOutcome::Forward(Message::MarketData(forwarded))
        } else if outcome.synthesize_ack {
            DispatchOutcome::ReplyUpstream(Message::MarketDataAck(AckMessage {
                envelope: Envelope { original_tx_id: tx, ..Envelope::default() },
            }))
        } else {
            DispatchOutcome::Suppress
        }
    }

    /// `reply_tx` is the unsubscribe message's own tx, used to correlate any
    /// reply sent back to the caller. `target_tx` is the subscriber being
    /// removed from the set — the unsubscribe's `original_tx_id` field when
    /// set, else `reply_tx` itself (a caller unsubscribing with its own
    /// earlier subscribe tx).
    fn dispatch_md_unsubscribe(
        &self,
        state: &mut RouterState,
        key_ref: &MdKeyRefBorrow<'_>,
        reply_tx: TxId,
        target_tx: TxId,
    ) -> DispatchOutcome {
        let outcome = match key_ref {
            MdKeyRefBorrow::Security(key) => state.md_by_key.unsubscribe(key, target_tx),
            MdKeyRefBorrow::NewsBoard(scope) => state.news_board_by_key.unsubscribe(scope, target_tx),
        };

        match outcome {
            UnsubscribeOutcome::NotFound => {
                state.md_by_tx.remove(&target_tx);
                self.non_exist_subscription_reply(reply_tx)
            }
            UnsubscribeOutcome::StillSubscribed => {
                state.md_by_tx.remove(&target_tx);
                DispatchOutcome::Suppress
            }
            UnsubscribeOutcome::Forward { original_tx_id } => {
                state.md_by_tx.remove(&target_tx);
                DispatchOutcome::Forward(Message::MarketData(MdMessage {
                    envelope: Envelope {
                        tx_id: reply_tx,
                        original_tx_id,
                        is_subscribe: false,
                        ..Envelope::default()
                    },
                    payload: match key_ref {
                        MdKeyRefBorrow::Security(key) => MdPayload::Security {
                            data_type: key.data_type,
                            security_id: key.security_id,
                            arg: key.arg.clone(),
                        },
                        MdKeyRefBorrow::NewsBoard(scope) => {
                            MdPayload::NewsBoard { scope: (*scope).to_owned() }
                        }
                    },
                }))
            }
        }
    }

    fn non_exist_subscription_reply(&self, tx: TxId) -> DispatchOutcome {
        if self.config.non_exist_subscription_as_error {
            DispatchOutcome::ReplyUpstream(Message::MarketDataAck(AckMessage {
                envelope: Envelope {
                    original_tx_id: tx,
                    error: Some("no live subscription for this key".to_owned()),
                    ..Envelope::default()
                },
            }))
        } else {
            tracing::warn!(tx, "unsubscribe for unknown subscription");
            DispatchOutcome::Suppress
        }
    }

    fn on_portfolio(&self, msg: PortfolioMessage) {
        let tx = msg.envelope.tx_id;
        if self.take_pass_through(tx) {
            self.downstream.send_in(Message::Portfolio(msg));
            return;
        }

        let is_subscribe = msg.envelope.is_subscribe;
        let name = normalize_scope(&msg.name);
        let target_tx = if msg.envelope.original_tx_id != NO_TX { msg.envelope.original_tx_id } else { tx };
        let outcome = {
            let mut state = self.lock();
            if is_subscribe {
                let (outcome, _handle) = state.portfolio_by_name.subscribe(
                    name,
                    tx,
                    msg.clone(),
                    self.config.support_multiple_subscriptions,
                );
                if outcome.is_history_only {
                    state.history_only_tx.insert(tx);
                }
                if outcome.forward {
                    let mut forwarded = msg;
                    forwarded.envelope.is_history = outcome.is_history_only;
                    DispatchOutcome::Forward(Message::Portfolio(forwarded))
                } else if outcome.synthesize_ack {
                    DispatchOutcome::ReplyUpstream(Message::MarketDataAck(AckMessage {
                        envelope: Envelope { original_tx_id: tx, ..Envelope::default() },
                    }))
                } else {
                    DispatchOutcome::Suppress
                }
            } else {
                match state.portfolio_by_name.unsubscribe(&name, target_tx) {
                    UnsubscribeOutcome::NotFound => self.non_exist_subscription_reply(tx),
                    UnsubscribeOutcome::StillSubscribed => DispatchOutcome::Suppress,
                    UnsubscribeOutcome::Forward { original_tx_id } => {
                        DispatchOutcome::Forward(Message::Portfolio(PortfolioMessage {
                            envelope: Envelope {
                                tx_id: tx,
                                original_tx_id,
                                is_subscribe: false,
                                ..Envelope::default()
                            },
                            name: msg.name,
                        }))
                    }
                }
            }
        };

        self.apply_dispatch_outcome(outcome);
    }

    fn on_order_status(&self, msg: OrderStatusMessage) {
        let tx = msg.envelope.tx_id;
        if self.take_pass_through(tx) {
            self.downstream.send_in(Message::OrderStatus(msg));
            return;
        }

        let is_subscribe = msg.envelope.is_subscribe;
        let target_tx = if msg.envelope.original_tx_id != NO_TX { msg.envelope.original_tx_id } else { tx };
        let outcome = {
            let mut state = self.lock();
            if is_subscribe {
                let (outcome, _handle) = state.order_status_by_tx.subscribe(tx, tx, msg.clone(), false);
                if outcome.forward {
                    DispatchOutcome::Forward(Message::OrderStatus(msg))
                } else {
                    DispatchOutcome::Suppress
                }
            } else {
                match state.order_status_by_tx.unsubscribe(&target_tx, target_tx) {
                    UnsubscribeOutcome::NotFound => self.non_exist_subscription_reply(tx),
                    UnsubscribeOutcome::StillSubscribed => DispatchOutcome::Suppress,
                    UnsubscribeOutcome::Forward { original_tx_id } => {
                        DispatchOutcome::Forward(Message::OrderStatus(OrderStatusMessage {
                            envelope: Envelope {
                                tx_id: tx,
                                original_tx_id,
                                is_subscribe: false,
                                ..Envelope::default()
                            },
                        }))
                    }
                }
            }
        };

        self.apply_dispatch_outcome(outcome);
    }

    fn on_portfolio_lookup(&self, msg: PortfolioLookupMessage) {
        let tx = msg.envelope.tx_id;
        if self.take_pass_through(tx) {
            self.downstream.send_in(Message::PortfolioLookup(msg));
            return;
        }

        let mut state = self.lock();
        state.pf_lookup_by_tx.subscribe(tx, tx, msg.clone(), false);

        let supported = self.downstream.supports_out("PortfolioLookupResult");
        let enqueued = state.lookups_portfolios.enqueue(msg.clone());
        if !supported {
            state.lookups_portfolios.arm_timeout(tx);
        }
        drop(state);

        if enqueued == Enqueued::Forward {
            self.downstream.send_in(Message::PortfolioLookup(msg));
        }
    }

    fn on_security_lookup(&self, msg: SecurityLookupMessage) {
        self.on_lookup(
            msg,
            "SecurityLookupResult",
            Message::SecurityLookup,
            |state| &mut state.lookups_securities,
        );
    }

    fn on_board_lookup(&self, msg: BoardLookupMessage) {
        self.on_lookup(msg, "BoardLookupResult", Message::BoardLookup, |state| {
            &mut state.lookups_boards
        });
    }

    fn on_time_frame_lookup(&self, msg: TimeFrameLookupMessage) {
        self.on_lookup(msg, "TimeFrameLookupResult", Message::TimeFrameLookup, |state| {
            &mut state.lookups_time_frames
        });
    }

    /// Shared enqueue-and-maybe-forward path for the three plain lookup kinds
    /// (securities, boards, time frames). Portfolio lookups are
    /// handled separately by [`Router::on_portfolio_lookup`] because they are
    /// also a subscription.
    fn on_lookup<M, F, S>(&self, msg: M, result_kind: &str, wrap: F, queue_of: S)
    where
        M: SubscriptionMessage + PartialEq,
        F: Fn(M) -> Message,
        S: Fn(&mut RouterState) -> &mut LookupQueue<M>,
    {
        let tx = msg.tx_id();
        if self.take_pass_through(tx) {
            self.downstream.send_in(wrap(msg));
            return;
        }

        let supported = self.downstream.supports_out(result_kind);
        let mut state = self.lock();
        let queue = queue_of(&mut state);
        let enqueued = queue.enqueue(msg.clone());
        if !supported {
            queue.arm_timeout(tx);
        }
        drop(state);

        if enqueued == Enqueued::Forward {
            self.downstream.send_in(wrap(msg));
        }
    }

    fn take_pass_through(&self, tx: TxId) -> bool {
        if tx == NO_TX {
            return false;
        }
        self.lock().pass_through_tx.remove(&tx)
    }

    fn apply_dispatch_outcome(&self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Forward(msg) => self.downstream.send_in(msg),
            DispatchOutcome::ReplyUpstream(msg) => self.upstream.raise_new_out(msg),
            DispatchOutcome::Suppress => {}
        }
    }

    // --------------------------------------------------------------- outbound

    /// Entry point for data and result messages from below.
    pub fn handle_out(&self, message: Message) {
        let local_time = message.envelope().and_then(|e| e.local_time);
        let emitted = self.dispatch_out(message);
        for msg in emitted {
            self.upstream.raise_new_out(msg);
        }
        self.observe_local_time(local_time);
    }

    #[expect(clippy::too_many_lines, reason = "one match arm per outbound message kind")]
    fn dispatch_out(&self, message: Message) -> Vec<Message> {
        match message {
            Message::Connect { ok: true } => self.on_connect_success(),
            Message::Connect { ok: false } => Vec::new(),
            Message::ReconnectingFinished => self.on_reconnecting_finished(),

            Message::MarketDataAck(ack) => self.on_market_data_ack(ack),

            Message::Security(mut ack) => {
                self.heartbeat_lookup_timeout(|s| &mut s.lookups_securities, ack.envelope.original_tx_id);
                vec![{
                    ack.envelope.subscription_ids = self.md_snapshot(ack.envelope.original_tx_id);
                    Message::Security(ack)
                }]
            }
            Message::Board(mut ack) => {
                self.heartbeat_lookup_timeout(|s| &mut s.lookups_boards, ack.envelope.original_tx_id);
                vec![{
                    ack.envelope.subscription_ids = self.md_snapshot(ack.envelope.original_tx_id);
                    Message::Board(ack)
                }]
            }

            Message::SecurityLookupResult(ack) => self.drain_lookup(
                |s| &mut s.lookups_securities,
                ack,
                Message::SecurityLookupResult,
                Message::SecurityLookup,
            ),
            Message::BoardLookupResult(ack) => self.drain_lookup(
                |s| &mut s.lookups_boards,
                ack,
                Message::BoardLookupResult,
                Message::BoardLookup,
            ),
            Message::TimeFrameLookupResult(ack) => self.drain_lookup(
                |s| &mut s.lookups_time_frames,
                ack,
                Message::TimeFrameLookupResult,
                Message::TimeFrameLookup,
            ),

            Message::PortfolioLookupResult(ack) => {
                let mut out = self.process_pf_lookup_ack(&ack);
                out.extend(self.drain_lookup(
                    |s| &mut s.lookups_portfolios,
                    ack,
                    Message::PortfolioLookupResult,
                    Message::PortfolioLookup,
                ));
                out
            }

            Message::Portfolio(mut data) => {
                self.heartbeat_lookup_timeout(
                    |s| &mut s.lookups_portfolios,
                    data.envelope.original_tx_id,
                );
                let (subscription_id, snapshot) = self.pf_tag(data.envelope.original_tx_id);
                data.envelope.subscription_id = subscription_id.unwrap_or(NO_TX);
                data.envelope.subscription_ids = snapshot;
                vec![Message::PortfolioData(data)]
            }

            Message::Candle(mut data) => {
                data.envelope.subscription_ids = self.md_snapshot(data.envelope.original_tx_id);
                vec![Message::Candle(data)]
            }
            Message::Tick(mut data) => {
                data.envelope.subscription_ids = self.md_snapshot(data.envelope.original_tx_id);
                vec![Message::Tick(data)]
            }
            Message::OrderLog(mut data) => {
                data.envelope.subscription_ids = self.md_snapshot(data.envelope.original_tx_id);
                vec![Message::OrderLog(data)]
            }
            Message::News(mut data) => {
                data.envelope.subscription_ids = self.md_snapshot(data.envelope.original_tx_id);
                vec![Message::News(data)]
            }
            Message::BoardState(mut data) => {
                data.envelope.subscription_ids = self.md_snapshot(data.envelope.original_tx_id);
                vec![Message::BoardState(data)]
            }

            Message::PortfolioChange(mut data) => {
                let (subscription_id, snapshot) = self.pf_tag(data.envelope.original_tx_id);
                data.envelope.subscription_id = subscription_id.unwrap_or(NO_TX);
                data.envelope.subscription_ids = snapshot;
                vec![Message::PortfolioChange(data)]
            }
            Message::PositionChange(mut data) => {
                let (subscription_id, snapshot) = self.pf_tag(data.envelope.original_tx_id);
                data.envelope.subscription_id = subscription_id.unwrap_or(NO_TX);
                data.envelope.subscription_ids = snapshot;
                vec![Message::PositionChange(data)]
            }

            Message::Execution(mut data) => {
                let (subscription_id, snapshot) = self.pf_tag(data.envelope.original_tx_id);
                data.envelope.subscription_id = subscription_id.unwrap_or(NO_TX);
                data.envelope.subscription_ids = snapshot;
                vec![Message::Execution(data)]
            }

            other => vec![other],
        }
    }

    fn on_connect_success(&self) -> Vec<Message> {
        let replay_list = {
            let mut state = self.lock();
            let to_replay = if self.config.restore_on_error_reconnect {
                state.snapshot_subscriptions()
            } else if self.config.restore_on_normal_reconnect {
                std::mem::take(&mut state.pending_replay)
            } else {
                Vec::new()
            };
            for msg in &to_replay {
                if let Some(tx) = msg.envelope().map(|e| e.tx_id) {
                    state.pass_through_tx.insert(tx);
                }
            }
            to_replay
        };

        tracing::debug!(count = replay_list.len(), "connect: replaying captured subscriptions");
        for msg in replay_list {
            self.upstream.on_send_in(replay::mark_for_replay(msg));
        }
        Vec::new()
    }

    fn on_reconnecting_finished(&self) -> Vec<Message> {
        if !self.config.restore_on_error_reconnect {
            return Vec::new();
        }
        self.on_connect_success()
    }

    /// `ProcessOutSubscriptionMessage` applied to an MD/NewsBoard ack.
    fn on_market_data_ack(&self, ack: AckMessage) -> Vec<Message> {
        let tx = ack.envelope.original_tx_id;

        {
            let mut state = self.lock();
            if state.history_only_tx.remove(&tx) || state.pass_through_tx.remove(&tx) {
                return Vec::new();
            }
        }

        let Some((key_ref, handle, requests, is_subscribed)) = ({
            let state = self.lock();
            state.md_by_tx.get(&tx).map(|(key_ref, handle)| {
                let mut info = handle.lock().unwrap_or_else(PoisonError::into_inner);
                info.is_subscribed = info.message.envelope.is_subscribe && ack.envelope.is_ok();
                let requests = info.requests.clone();
                let is_subscribed = info.is_subscribed;
                drop(info);
                (key_ref.clone(), Arc::clone(handle), requests, is_subscribed)
            })
        }) else {
            // Not one of ours: forward the raw ack upstream unchanged.
            return vec![Message::MarketDataAck(ack)];
        };

        if !is_subscribed {
            let mut state = self.lock();
            state.md_by_tx.remove(&tx);
            match &key_ref {
                MdKeyRef::Security(key) => state.md_by_key.remove(key),
                MdKeyRef::NewsBoard(scope) => state.news_board_by_key.remove(scope),
            }
            drop(handle);
        }

        requests
            .into_iter()
            .map(|request| {
                Message::MarketDataAck(AckMessage {
                    envelope: Envelope {
                        original_tx_id: request.envelope.tx_id,
                        error: ack.envelope.error.clone(),
                        is_not_supported: ack.envelope.is_not_supported,
                        ..Envelope::default()
                    },
                })
            })
            .collect()
    }

    /// Resolves a `PortfolioLookupResult` as a portfolio-lookup subscription
    /// ack first ("first resolve as a portfolio-lookup subscription
    /// ack; then drain queue").
    fn process_pf_lookup_ack(&self, ack: &AckMessage) -> Vec<Message> {
        let tx = ack.envelope.original_tx_id;
        let mut state = self.lock();

        if state.history_only_tx.remove(&tx) || state.pass_through_tx.remove(&tx) {
            return Vec::new();
        }

        let Some(handle) = state.pf_lookup_by_tx.get(&tx) else {
            return Vec::new();
        };

        let (requests, is_subscribed) = {
            let mut info = handle.lock().unwrap_or_else(PoisonError::into_inner);
            info.is_subscribed = info.message.envelope.is_subscribe && ack.envelope.is_ok();
            (info.requests.clone(), info.is_subscribed)
        };

        if !is_subscribed {
            state.pf_lookup_by_tx.remove(&tx);
        }
        drop(state);

        requests
            .into_iter()
            .map(|request| {
                Message::PortfolioLookupResult(AckMessage {
                    envelope: Envelope {
                        original_tx_id: request.envelope.tx_id,
                        error: ack.envelope.error.clone(),
                        is_not_supported: ack.envelope.is_not_supported,
                        ..Envelope::default()
                    },
                })
            })
            .collect()
    }

    fn drain_lookup<M, F, G>(
        &self,
        queue_of: impl Fn(&mut RouterState) -> &mut LookupQueue<M>,
        ack: AckMessage,
        wrap_result: F,
        wrap_request: G,
    ) -> Vec<Message>
    where
        M: SubscriptionMessage + PartialEq,
        F: Fn(AckMessage) -> Message,
        G: Fn(M) -> Message,
    {
        let tx = ack.envelope.original_tx_id;
        let mut state = self.lock();
        let reemit = queue_of(&mut state).on_result(tx);
        drop(state);

        if let Some(reemit) = reemit {
            self.downstream.send_in(wrap_request(reemit.message));
        }
        vec![wrap_result(ack)]
    }

    fn heartbeat_lookup_timeout<M>(
        &self,
        queue_of: impl Fn(&mut RouterState) -> &mut LookupQueue<M>,
        tx: TxId,
    ) {
        let mut state = self.lock();
        queue_of(&mut state).timeouts().update(tx);
    }

    fn md_snapshot(&self, original_tx_id: TxId) -> SubscriberSnapshot {
        let state = self.lock();
        state.md_by_tx.get(&original_tx_id).map_or_else(
            || SubscriberSnapshot::from(Vec::new()),
            |(_, handle)| {
                let mut info = handle.lock().unwrap_or_else(PoisonError::into_inner);
                info.subscribers.cached_snapshot()
            },
        )
    }

    /// Transactional tagging policy for executions/portfolio/position changes
    ///: if `original_tx_id` is live in `pf_lookup_by_tx`, tag
    /// `subscription_id` with it directly; `subscription_ids` always comes
    /// from the *first* live entry's snapshot — a documented limitation.
    fn pf_tag(&self, original_tx_id: TxId) -> (Option<TxId>, SubscriberSnapshot) {
        let state = self.lock();
        let direct = state.pf_lookup_by_tx.get(&original_tx_id).is_some().then_some(original_tx_id);
        let snapshot = state
            .pf_lookup_by_tx
            .handles()
            .first()
            .map(|handle| handle.lock().unwrap_or_else(PoisonError::into_inner).subscribers.cached_snapshot());
        (direct, snapshot.unwrap_or_else(|| SubscriberSnapshot::from(Vec::new())))
    }

    /// Advances the timeout wheels of all four lookup kinds by the delta
    /// between this outbound message's `local_time` and the previously
    /// observed one, firing synthetic results for any lookup that timed out.
    fn observe_local_time(&self, local_time: Option<Duration>) {
        let Some(now) = local_time else { return };
        let fired = {
            let mut state = self.lock();
            let delta = state.prev_local_time.and_then(|prev| now.checked_sub(prev));
            state.prev_local_time = Some(now);
            let Some(delta) = delta else { return };

            let mut fired = Vec::new();
            fired.extend(
                state
                    .lookups_securities
                    .tick(delta)
                    .into_iter()
                    .map(|tx| Message::SecurityLookupResult(timeout_ack(tx))),
            );
            fired.extend(
                state
                    .lookups_boards
                    .tick(delta)
                    .into_iter()
                    .map(|tx| Message::BoardLookupResult(timeout_ack(tx))),
            );
            fired.extend(
                state
                    .lookups_time_frames
                    .tick(delta)
                    .into_iter()
                    .map(|tx| Message::TimeFrameLookupResult(timeout_ack(tx))),
            );
            fired.extend(
                state
                    .lookups_portfolios
                    .tick(delta)
                    .into_iter()
                    .map(|tx| Message::PortfolioLookupResult(timeout_ack(tx))),
            );
            fired
        };

        for msg in fired {
            tracing::warn!(tx = msg.original_tx_id(), kind = msg.kind_name(), "lookup timed out");
            self.upstream.raise_new_out(msg);
        }
    }
}

fn timeout_ack(tx: TxId) -> AckMessage {
    AckMessage { envelope: Envelope { original_tx_id: tx, ..Envelope::default() } }
}

/// Borrowed form of [`MdKeyRef`] used at unsubscribe time, when the router
/// hasn't decided yet whether it needs to own the key.
enum MdKeyRefBorrow<'a> {
    Security(&'a MarketDataKey),
    NewsBoard(&'a str),
}

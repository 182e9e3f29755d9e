//! Message envelope and the closed set of message kinds the router dispatches on.
//!
//! The core owns no wire format. This module defines just enough of an
//! envelope — and just enough per-kind payload — for the router to route,
//! deduplicate, tag, and time out traffic. Embedders translate to/from their
//! own venue protocol at the `UpstreamSink`/`DownstreamAdapter` boundary.
//!
//! These types are deliberately exhaustive, not `#[non_exhaustive]`: embedders
//! construct them directly at the `send_in`/`handle_out` boundary, and the
//! variant set is meant to stay closed.
#![allow(
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    reason = "message types are a closed, embedder-constructed surface"
)]

use std::sync::Arc;
use std::time::Duration;

/// Transaction id. `0` means "absent".
pub type TxId = u64;

/// The reserved "absent" transaction id.
pub const NO_TX: TxId = 0;

/// Immutable snapshot of subscriber ids, shared cheaply between the table and
/// every outbound message tagged from it.
pub type SubscriberSnapshot = Arc<[TxId]>;

fn empty_snapshot() -> SubscriberSnapshot {
    Arc::from(Vec::new())
}

/// Fields the router touches on every message, regardless of payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub tx_id: TxId,
    pub original_tx_id: TxId,
    pub is_subscribe: bool,
    pub is_history: bool,
    pub is_back: bool,
    pub is_not_supported: bool,
    pub error: Option<String>,
    pub local_time: Option<Duration>,
    pub subscription_id: TxId,
    pub subscription_ids: SubscriberSnapshot,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            tx_id: NO_TX,
            original_tx_id: NO_TX,
            is_subscribe: false,
            is_history: false,
            is_back: false,
            is_not_supported: false,
            error: None,
            local_time: None,
            subscription_id: NO_TX,
            subscription_ids: empty_snapshot(),
        }
    }
}

impl Envelope {
    #[must_use]
    pub fn new(tx_id: TxId) -> Self {
        Self { tx_id, ..Self::default() }
    }

    /// A downstream ack/result is treated as ok when no `error` is set and the
    /// kind does support the request (`is_not_supported` unset).
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && !self.is_not_supported
    }
}

/// Capability bound shared by every message kind that can live inside a
/// [`crate::table::SubscriptionTable`] or [`crate::lookup::LookupQueue`].
pub trait SubscriptionMessage: Clone + std::fmt::Debug {
    fn envelope(&self) -> &Envelope;
    fn envelope_mut(&mut self) -> &mut Envelope;

    fn tx_id(&self) -> TxId {
        self.envelope().tx_id
    }

    fn original_tx_id(&self) -> TxId {
        self.envelope().original_tx_id
    }

    fn is_subscribe(&self) -> bool {
        self.envelope().is_subscribe
    }

    fn set_original_tx_id(&mut self, tx: TxId) {
        self.envelope_mut().original_tx_id = tx;
    }

    fn set_is_history(&mut self, is_history: bool) {
        self.envelope_mut().is_history = is_history;
    }

    fn set_is_back(&mut self, is_back: bool) {
        self.envelope_mut().is_back = is_back;
    }
}

/// Implements [`SubscriptionMessage`] for a struct with an `envelope: Envelope` field.
macro_rules! impl_subscription_message {
    ($ty:ty) => {
        impl SubscriptionMessage for $ty {
            fn envelope(&self) -> &Envelope {
                &self.envelope
            }

            fn envelope_mut(&mut self) -> &mut Envelope {
                &mut self.envelope
            }
        }
    };
}

/// A market-data data type that requires a security id to disambiguate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketDataType {
    Quote,
    Trade,
    OrderLog,
    Candle,
}

/// Payload of an `MD` subscribe/unsubscribe request — either a security-keyed
/// market-data stream or a news-id/board-code scoped stream. Both share one
/// message type and one by-tx index.
#[derive(Debug, Clone, PartialEq)]
pub enum MdPayload {
    Security { data_type: MarketDataType, security_id: Option<u64>, arg: String },
    NewsBoard { scope: String },
}

/// Subscribe/unsubscribe request for any market-data stream.
#[derive(Debug, Clone)]
pub struct MdMessage {
    pub envelope: Envelope,
    pub payload: MdPayload,
}
impl_subscription_message!(MdMessage);

/// Subscribe/unsubscribe request for a named portfolio stream.
#[derive(Debug, Clone)]
pub struct PortfolioMessage {
    pub envelope: Envelope,
    pub name: String,
}
impl_subscription_message!(PortfolioMessage);

/// Subscribe/unsubscribe request for order-status updates. One per request,
/// never shared — the table key is the tx itself.
#[derive(Debug, Clone)]
pub struct OrderStatusMessage {
    pub envelope: Envelope,
}
impl_subscription_message!(OrderStatusMessage);

/// A portfolio-lookup request, which is both a subscription and a
/// one-shot lookup.
#[derive(Debug, Clone)]
pub struct PortfolioLookupMessage {
    pub envelope: Envelope,
    pub name: String,
}
impl_subscription_message!(PortfolioLookupMessage);

/// A securities lookup request.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityLookupMessage {
    pub envelope: Envelope,
    pub query: String,
}
impl_subscription_message!(SecurityLookupMessage);

/// A board lookup request.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardLookupMessage {
    pub envelope: Envelope,
    pub board: String,
}
impl_subscription_message!(BoardLookupMessage);

/// A time-frame lookup request.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeFrameLookupMessage {
    pub envelope: Envelope,
    pub security_id: u64,
}
impl_subscription_message!(TimeFrameLookupMessage);

/// A generic ack/result carrying just the envelope (downstream acks, lookup
/// results, connect lifecycle).
#[derive(Debug, Clone, Default)]
pub struct AckMessage {
    pub envelope: Envelope,
}
impl_subscription_message!(AckMessage);

/// Streaming data payload tagged with `subscription_ids` on its way upstream.
#[derive(Debug, Clone, Default)]
pub struct DataMessage {
    pub envelope: Envelope,
}
impl_subscription_message!(DataMessage);

/// The closed set of message variants the router understands.
///
/// Dispatch is a `match` on this enum, not virtual dispatch — the variant set
/// is meant to stay closed and exhaustive for this subsystem.
#[derive(Debug, Clone)]
pub enum Message {
    Reset,
    Disconnect,
    Connect { ok: bool },
    ReconnectingFinished,

    MarketData(MdMessage),
    MarketDataAck(AckMessage),

    Portfolio(PortfolioMessage),
    /// Outbound portfolio data/heartbeat, tagged with its subscribers.
    PortfolioData(DataMessage),

    OrderStatus(OrderStatusMessage),

    PortfolioLookup(PortfolioLookupMessage),
    PortfolioLookupResult(AckMessage),

    SecurityLookup(SecurityLookupMessage),
    SecurityLookupResult(AckMessage),
    /// Streamed security reference data that heartbeats a live lookup.
    Security(AckMessage),

    BoardLookup(BoardLookupMessage),
    BoardLookupResult(AckMessage),
    /// Streamed board reference data that heartbeats a live lookup.
    Board(AckMessage),

    TimeFrameLookup(TimeFrameLookupMessage),
    TimeFrameLookupResult(AckMessage),

    Candle(DataMessage),
    Tick(DataMessage),
    OrderLog(DataMessage),
    News(DataMessage),
    BoardState(DataMessage),
    PortfolioChange(DataMessage),
    PositionChange(DataMessage),
    /// Order-and-trade execution stream.
    Execution(DataMessage),
}

impl Message {
    /// A short tag for logging, matching the reference codebase's `%e`/`?field`
    /// tracing convention of logging small copy types rather than full payloads.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Reset => "Reset",
            Self::Disconnect => "Disconnect",
            Self::Connect { .. } => "Connect",
            Self::ReconnectingFinished => "ReconnectingFinished",
            Self::MarketData(_) => "MarketData",
            Self::MarketDataAck(_) => "MarketDataAck",
            Self::Portfolio(_) => "Portfolio",
            Self::PortfolioData(_) => "PortfolioData",
            Self::OrderStatus(_) => "OrderStatus",
            Self::PortfolioLookup(_) => "PortfolioLookup",
            Self::PortfolioLookupResult(_) => "PortfolioLookupResult",
            Self::SecurityLookup(_) => "SecurityLookup",
            Self::SecurityLookupResult(_) => "SecurityLookupResult",
            Self::Security(_) => "Security",
            Self::BoardLookup(_) => "BoardLookup",
            Self::BoardLookupResult(_) => "BoardLookupResult",
            Self::Board(_) => "Board",
            Self::TimeFrameLookup(_) => "TimeFrameLookup",
            Self::TimeFrameLookupResult(_) => "TimeFrameLookupResult",
            Self::Candle(_) => "Candle",
            Self::Tick(_) => "Tick",
            Self::OrderLog(_) => "OrderLog",
            Self::News(_) => "News",
            Self::BoardState(_) => "BoardState",
            Self::PortfolioChange(_) => "PortfolioChange",
            Self::PositionChange(_) => "PositionChange",
            Self::Execution(_) => "Execution",
        }
    }

    /// Shared envelope accessor, when the variant carries one.
    #[must_use]
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Reset | Self::Disconnect | Self::Connect { .. } | Self::ReconnectingFinished => {
                None
            }
            Self::MarketData(m) => Some(&m.envelope),
            Self::MarketDataAck(m)
            | Self::PortfolioLookupResult(m)
            | Self::SecurityLookupResult(m)
            | Self::Security(m)
            | Self::BoardLookupResult(m)
            | Self::Board(m)
            | Self::TimeFrameLookupResult(m) => Some(&m.envelope),
            Self::Portfolio(m) => Some(&m.envelope),
            Self::PortfolioData(m)
            | Self::Candle(m)
            | Self::Tick(m)
            | Self::OrderLog(m)
            | Self::News(m)
            | Self::BoardState(m)
            | Self::PortfolioChange(m)
            | Self::PositionChange(m)
            | Self::Execution(m) => Some(&m.envelope),
            Self::OrderStatus(m) => Some(&m.envelope),
            Self::PortfolioLookup(m) => Some(&m.envelope),
            Self::SecurityLookup(m) => Some(&m.envelope),
            Self::BoardLookup(m) => Some(&m.envelope),
            Self::TimeFrameLookup(m) => Some(&m.envelope),
        }
    }

    #[must_use]
    pub fn envelope_mut(&mut self) -> Option<&mut Envelope> {
        match self {
            Self::Reset | Self::Disconnect | Self::Connect { .. } | Self::ReconnectingFinished => {
                None
            }
            Self::MarketData(m) => Some(&mut m.envelope),
            Self::MarketDataAck(m)
            | Self::PortfolioLookupResult(m)
            | Self::SecurityLookupResult(m)
            | Self::Security(m)
            | Self::BoardLookupResult(m)
            | Self::Board(m)
            | Self::TimeFrameLookupResult(m) => Some(&mut m.envelope),
            Self::Portfolio(m) => Some(&mut m.envelope),
            Self::PortfolioData(m)
            | Self::Candle(m)
            | Self::Tick(m)
            | Self::OrderLog(m)
            | Self::News(m)
            | Self::BoardState(m)
            | Self::PortfolioChange(m)
            | Self::PositionChange(m)
            | Self::Execution(m) => Some(&mut m.envelope),
            Self::OrderStatus(m) => Some(&mut m.envelope),
            Self::PortfolioLookup(m) => Some(&mut m.envelope),
            Self::SecurityLookup(m) => Some(&mut m.envelope),
            Self::BoardLookup(m) => Some(&mut m.envelope),
            Self::TimeFrameLookup(m) => Some(&mut m.envelope),
        }
    }

    #[must_use]
    pub fn tx_id(&self) -> TxId {
        self.envelope().map_or(NO_TX, |e| e.tx_id)
    }

    #[must_use]
    pub fn original_tx_id(&self) -> TxId {
        self.envelope().map_or(NO_TX, |e| e.original_tx_id)
    }
}

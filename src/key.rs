//! Subscription key types — the equivalence classes that decide whether
//! two subscribe requests can share one physical subscription.

use crate::message::{MarketDataType, TxId};

/// Key for a security-required market-data subscription.
///
/// When the downstream adapter reports
/// [`DownstreamAdapter::is_support_subscription_by_security`](crate::adapter::DownstreamAdapter::is_support_subscription_by_security)
/// as `false`, `security_id` is zeroed (set to `None`) before this key is
/// constructed, so two subscribes differing only in security id collapse
/// into the same physical subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarketDataKey {
    pub data_type: MarketDataType,
    pub security_id: Option<u64>,
    pub arg: String,
}

/// Normalizes a free-form scope string (news id or board code) for
/// case-insensitive key comparisons. The original casing is kept
/// on the stored message; only the map key is normalized.
#[must_use]
pub fn normalize_scope(scope: &str) -> String {
    scope.to_lowercase()
}

/// Key for order-status and portfolio-lookup subscriptions: the transaction
/// id itself, since these are never shared across subscribers.
pub type TxKey = TxId;

//! Reference-counted subscriber set — tracks the logical
//! subscribers of a physical subscription and caches an immutable snapshot
//! for cheap sharing onto outbound tagged messages.

use std::collections::HashSet;

use crate::message::{SubscriberSnapshot, TxId};

/// Set of logical subscriber tx ids for one [`SubscriptionInfo`](crate::table::SubscriptionInfo).
///
/// `cached_snapshot` is rebuilt lazily on the first read after a mutation
///, guarded by the same lock that guards everything
/// else in the router — there is no separate synchronization here.
#[derive(Debug, Default)]
pub struct SubscriberSet {
    ids: HashSet<TxId>,
    snapshot: Option<SubscriberSnapshot>,
}

impl SubscriberSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `tx`, returning `true` if it was not already present.
    pub fn add(&mut self, tx: TxId) -> bool {
        let inserted = self.ids.insert(tx);
        if inserted {
            self.snapshot = None;
        }
        inserted
    }

    /// Removes `tx`, returning `true` if it was present.
    pub fn remove(&mut self, tx: TxId) -> bool {
        let removed = self.ids.remove(&tx);
        if removed {
            self.snapshot = None;
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, tx: TxId) -> bool {
        self.ids.contains(&tx)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns the cached immutable snapshot, rebuilding it first if the set
    /// was mutated since the last snapshot. Consumers share the returned
    /// `Arc` rather than copying the underlying ids.
    pub fn cached_snapshot(&mut self) -> SubscriberSnapshot {
        if let Some(snapshot) = &self.snapshot {
            return SubscriberSnapshot::clone(snapshot);
        }
        let mut ids: Vec<TxId> = self.ids.iter().copied().collect();
        ids.sort_unstable();
        let snapshot: SubscriberSnapshot = ids.into();
        self.snapshot = Some(SubscriberSnapshot::clone(&snapshot));
        snapshot
    }
}

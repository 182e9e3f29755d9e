//! Timeout wheel — per-transaction countdowns driven by observed
//! clock deltas. There is no owned timer thread: the wheel only moves when
//! [`TimeoutWheel::tick`] is called, which the router does once per outbound
//! message.

use std::collections::HashMap;
use std::time::Duration;

use crate::message::{NO_TX, TxId};

/// Per-kind countdown table mapping `tx_id -> remaining duration`.
#[derive(Debug, Clone)]
pub struct TimeoutWheel {
    timeout: Duration,
    remaining: HashMap<TxId, Duration>,
}

impl TimeoutWheel {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, remaining: HashMap::new() }
    }

    /// Starts a countdown for `tx`, unless the configured timeout is zero,
    /// `tx` is the absent sentinel, or a countdown is already running for it
    ///.
    pub fn start(&mut self, tx: TxId) {
        if self.timeout.is_zero() || tx == NO_TX {
            return;
        }
        self.remaining.entry(tx).or_insert(self.timeout);
    }

    /// Resets the countdown for `tx` back to the full timeout, but only if one
    /// is already running — used as a liveness heartbeat from matching data
    /// frames, never to start a new countdown.
    pub fn update(&mut self, tx: TxId) {
        if let Some(remaining) = self.remaining.get_mut(&tx) {
            *remaining = self.timeout;
        }
    }

    /// Unconditionally removes any countdown for `tx`.
    pub fn remove(&mut self, tx: TxId) -> bool {
        self.remaining.remove(&tx).is_some()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }

    pub fn clear(&mut self) {
        self.remaining.clear();
    }

    /// Advances every running countdown by `delta`, evicting and returning
    /// every `tx` whose remaining time reached zero or below.
    ///
    /// The snapshot is taken up front so the eviction decision is made
    /// atomically against the deltas observed this tick; nothing here
    /// re-reads `self.remaining` mid-pass.
    pub fn tick(&mut self, delta: Duration) -> Vec<TxId> {
        if delta.is_zero() || self.remaining.is_empty() {
            return Vec::new();
        }
        let mut fired = Vec::new();
        self.remaining.retain(|&tx, remaining| {
            let next = remaining.checked_sub(delta).unwrap_or(Duration::ZERO);
            if next.is_zero() {
                fired.push(tx);
                false
            } else {
                *remaining = next;
                true
            }
        });
        fired
    }
}

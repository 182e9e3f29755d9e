//! External interfaces: the two collaborators the router is wired
//! between. Transport I/O, wire serialization, and the concrete venue
//! protocol live on the other side of these traits — out of scope here.

use crate::message::{Message, TxId};

/// The downstream transport adapter that actually talks to the venue.
pub trait DownstreamAdapter: Send + Sync {
    /// Forwards a message to the venue transport.
    fn send_in(&self, message: Message);

    /// Capability probe: does this adapter ever emit the given outbound kind?
    /// Used to decide whether to arm a lookup timeout — if the answer
    /// is `false`, the router must supply a synthetic result itself, because
    /// none will ever arrive downstream.
    fn supports_out(&self, kind: &str) -> bool;

    /// Monotonic transaction id source, used only for the router's own
    /// synthetic messages — never for messages the embedder sent in.
    fn next_tx_id(&self) -> TxId;

    /// When `false`, market-data keys are constructed with `security_id`
    /// zeroed, collapsing subscriptions that only differ by security.
    fn is_support_subscription_by_security(&self) -> bool;
}

/// The upstream client-facing sink the router delivers outbound traffic to.
pub trait UpstreamSink: Send + Sync {
    /// Delivers an outbound message to the client.
    fn raise_new_out(&self, message: Message);

    /// Re-enters the inbound pipeline for a replayed subscribe. The
    /// caller has already set `is_back = true` on `message`.
    fn on_send_in(&self, message: Message);
}

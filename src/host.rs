//! The overlay host.
//!
//! [`Host`] ties the subsystems together: it resolves recipients through
//! the routing table, transports messages over cached stream connections,
//! relays broadcasts along the topology-aware tree with fingerprint
//! deduplication, and gates everything through the ban list. Outcomes
//! reach the owner as [`Event`]s on an unbounded channel; the sender side
//! runs on worker tasks, so consumers must treat events as concurrent.

mod queue;
mod registration;
mod server;

pub use server::Host;

use crate::dht::NodeContact;
use crate::id::{FragmentId, NodeId};
use crate::stream::DropReason;

/// Everything the overlay reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A direct or broadcast payload addressed to this node.
    MessageReceived { from: NodeId, payload: Vec<u8> },
    /// A peer entered the routing table.
    NodeDiscovered(NodeContact),
    /// A peer was evicted from the routing table.
    NodeRemoved(NodeContact),
    /// A node lookup located its target.
    NodeFound(NodeContact),
    /// A node lookup expired unresolved.
    NodeNotFound(NodeId),
    /// A fragment lookup resolved.
    FragmentFound { id: FragmentId, data: Vec<u8> },
    /// A fragment lookup expired unresolved.
    FragmentNotFound(FragmentId),
    /// A registered stream connection went away.
    ConnectionDropped { peer: NodeId, reason: DropReason },
}

//! Kademlia routing and the datagram protocol.
//!
//! The routing table keeps up to [`K`] peers per bit of XOR distance from
//! the local id, refreshed by three background workers:
//!
//! - the **pinger** probes bucket members and evicts peers that miss
//!   three consecutive pings;
//! - the **explorer** runs iterative `FIND_NODE` lookups and a periodic
//!   random-id discovery walk;
//! - the **fragment collector** resolves and republishes stored
//!   fragments.
//!
//! All unsolicited traffic arrives on one UDP socket and is dispatched
//! from a single decode point; outcomes surface as [`TableEvent`]s on the
//! owner's channel.

mod bucket;
mod collector;
mod error;
mod explorer;
mod message;
mod node;
mod pinger;
mod socket;
mod table;

pub use collector::MAX_FRAGMENT_SIZE;
pub use error::DhtError;
pub use message::{Datagram, DatagramType, Payload};
pub use node::NodeContact;
pub use socket::{DatagramSocket, MAX_DATAGRAM_SIZE};
pub use table::{RoutingTable, TableEvent, K};

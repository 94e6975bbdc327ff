//! kadnet - a Kademlia-style peer-to-peer overlay network
//!
//! Each node maintains an approximate membership view of the overlay in a
//! 256-bit id space, exchanges unicast messages over persistent stream
//! connections, disseminates broadcasts along a topology-aware tree, and
//! stores opaque byte fragments addressed by 256-bit keys with periodic
//! republication.
//!
//! # Modules
//!
//! - [`id`] - 256-bit identifier arithmetic (XOR metric, CLZ)
//! - [`codec`] - little-endian wire serialization
//! - [`dht`] - routing table, k-buckets and the datagram protocol
//! - [`stream`] - framed TCP transport with the registration handshake
//! - [`host`] - the orchestrator tying routing, transport and bans together
//! - [`store`] - fragment persistence
//! - [`banman`] - endpoint ban list
//!
//! # Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//! use kadnet::{Config, Host, Event, MemoryStore, NodeId};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new(NodeId::generate());
//! let (host, mut events) = Host::spawn(config, Arc::new(MemoryStore::new())).await?;
//!
//! host.send_broadcast(b"hello overlay".to_vec());
//!
//! while let Some(event) = events.recv().await {
//!     if let Event::MessageReceived { from, payload } = event {
//!         println!("{} says {:?}", from, payload);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod banman;
pub mod codec;
pub mod config;
pub mod dht;
pub mod error;
pub mod host;
pub mod id;
pub mod store;
pub mod stream;

pub use banman::{BanEntry, BanMan};
pub use codec::{CodecError, Serializer, Unserializer};
pub use config::{default_boot_nodes, Config, DEFAULT_PORT};
pub use dht::{
    Datagram, DhtError, NodeContact, Payload, RoutingTable, MAX_DATAGRAM_SIZE, MAX_FRAGMENT_SIZE, K,
};
pub use error::KadError;
pub use host::{Event, Host};
pub use id::{DivisionByZero, FragmentId, NodeId};
pub use store::{DiskStore, FragmentStore, MemoryStore, StoreError};
pub use stream::{DropReason, Packet, PacketHeader, PacketType};

//! Framed stream transport.
//!
//! Every connection speaks the same protocol regardless of who dialed:
//! length-prefixed [`Packet`] frames, opened by exactly one Registration
//! exchange that binds the socket to the remote's node id. A single idle
//! deadline covers both directions; the connection drops with a
//! [`DropReason`] on timeout, I/O failure or protocol violation, and the
//! first drop is the only one the owner hears about.

mod connection;
mod packet;

pub(crate) use connection::{ConnEvent, Connection, ConnectionHandle};
pub use connection::DropReason;
pub use packet::{Packet, PacketHeader, PacketId, PacketType, HEADER_SIZE, MAX_PACKET_DATA_SIZE};

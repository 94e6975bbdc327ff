use bytes::Bytes;

use super::error::DhtError;
use super::node::NodeContact;
use super::socket::MAX_DATAGRAM_SIZE;
use crate::codec::{CodecError, Serializer, Unserializer};
use crate::id::{FragmentId, NodeId};
use std::net::SocketAddr;

/// Wire discriminants of the datagram protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DatagramType {
    Ping = 1,
    Pong = 2,
    FindNode = 3,
    FindNodes = 4,
    FindFragment = 5,
    FragmentFound = 6,
    FragmentNotFound = 7,
    Store = 8,
}

impl TryFrom<u8> for DatagramType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DatagramType::Ping),
            2 => Ok(DatagramType::Pong),
            3 => Ok(DatagramType::FindNode),
            4 => Ok(DatagramType::FindNodes),
            5 => Ok(DatagramType::FindFragment),
            6 => Ok(DatagramType::FragmentFound),
            7 => Ok(DatagramType::FragmentNotFound),
            8 => Ok(DatagramType::Store),
            _ => Err(CodecError::Malformed("unknown datagram type")),
        }
    }
}

/// Body of a datagram, one variant per protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Ping { user_data: u64 },
    Pong { user_data: u64 },
    FindNode { target: NodeId, user_data: u64 },
    FindNodes { target: NodeId, closest: Vec<NodeContact>, user_data: u64 },
    FindFragment { target: FragmentId },
    FragmentFound { target: FragmentId, fragment: Vec<u8> },
    FragmentNotFound { target: FragmentId, closest: Vec<NodeContact> },
    Store { id: FragmentId, fragment: Vec<u8> },
}

impl Payload {
    pub fn datagram_type(&self) -> DatagramType {
        match self {
            Payload::Ping { .. } => DatagramType::Ping,
            Payload::Pong { .. } => DatagramType::Pong,
            Payload::FindNode { .. } => DatagramType::FindNode,
            Payload::FindNodes { .. } => DatagramType::FindNodes,
            Payload::FindFragment { .. } => DatagramType::FindFragment,
            Payload::FragmentFound { .. } => DatagramType::FragmentFound,
            Payload::FragmentNotFound { .. } => DatagramType::FragmentNotFound,
            Payload::Store { .. } => DatagramType::Store,
        }
    }
}

/// A decoded datagram: the sender's contact plus the message body.
///
/// The sender's address and UDP port come from the packet's source
/// endpoint, never from the body; the body only vouches for the id and
/// TCP port.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub from: NodeContact,
    pub payload: Payload,
}

impl Datagram {
    /// Encodes a message originating at `from`.
    ///
    /// Fails when the encoded size would exceed [`MAX_DATAGRAM_SIZE`].
    pub fn encode(from: &NodeContact, payload: &Payload) -> Result<Bytes, DhtError> {
        let mut s = Serializer::with_capacity(64);
        s.put_u8(payload.datagram_type() as u8);
        s.put_raw(&from.id.to_le_bytes());
        s.put_u16(from.tcp_port);

        match payload {
            Payload::Ping { user_data } | Payload::Pong { user_data } => {
                s.put_u64(*user_data);
            }
            Payload::FindNode { target, user_data } => {
                s.put_raw(&target.to_le_bytes());
                s.put_u64(*user_data);
            }
            Payload::FindNodes { target, closest, user_data } => {
                s.put_raw(&target.to_le_bytes());
                s.put_usize(closest.len());
                for contact in closest {
                    contact.put(&mut s);
                }
                s.put_u64(*user_data);
            }
            Payload::FindFragment { target } => {
                s.put_raw(&target.to_le_bytes());
            }
            Payload::FragmentFound { target, fragment } => {
                s.put_raw(&target.to_le_bytes());
                s.put_bytes(fragment);
            }
            Payload::FragmentNotFound { target, closest } => {
                s.put_raw(&target.to_le_bytes());
                s.put_usize(closest.len());
                for contact in closest {
                    contact.put(&mut s);
                }
            }
            Payload::Store { id, fragment } => {
                s.put_raw(&id.to_le_bytes());
                s.put_bytes(fragment);
            }
        }

        if s.len() > MAX_DATAGRAM_SIZE {
            return Err(DhtError::DatagramTooLarge(s.len()));
        }
        Ok(s.into_bytes())
    }

    /// Decodes a raw packet received from `src`.
    pub fn decode(src: SocketAddr, data: &[u8]) -> Result<Datagram, CodecError> {
        let mut u = Unserializer::new(data);

        let kind = DatagramType::try_from(u.get_u8()?)?;
        let id = NodeId::from_le_bytes(u.get_array::<32>()?);
        let tcp_port = u.get_u16()?;
        let from = NodeContact::new(id, src.ip(), src.port(), tcp_port);

        let payload = match kind {
            DatagramType::Ping => Payload::Ping { user_data: u.get_u64()? },
            DatagramType::Pong => Payload::Pong { user_data: u.get_u64()? },
            DatagramType::FindNode => Payload::FindNode {
                target: NodeId::from_le_bytes(u.get_array::<32>()?),
                user_data: u.get_u64()?,
            },
            DatagramType::FindNodes => {
                let target = NodeId::from_le_bytes(u.get_array::<32>()?);
                let closest = Self::get_contacts(&mut u)?;
                Payload::FindNodes { target, closest, user_data: u.get_u64()? }
            }
            DatagramType::FindFragment => Payload::FindFragment {
                target: NodeId::from_le_bytes(u.get_array::<32>()?),
            },
            DatagramType::FragmentFound => Payload::FragmentFound {
                target: NodeId::from_le_bytes(u.get_array::<32>()?),
                fragment: u.get_bytes()?,
            },
            DatagramType::FragmentNotFound => {
                let target = NodeId::from_le_bytes(u.get_array::<32>()?);
                let closest = Self::get_contacts(&mut u)?;
                Payload::FragmentNotFound { target, closest }
            }
            DatagramType::Store => Payload::Store {
                id: NodeId::from_le_bytes(u.get_array::<32>()?),
                fragment: u.get_bytes()?,
            },
        };

        Ok(Datagram { from, payload })
    }

    fn get_contacts(u: &mut Unserializer<'_>) -> Result<Vec<NodeContact>, CodecError> {
        let count = u.get_usize()?;
        // An honest contact list is bounded by what fits in a datagram.
        if count > MAX_DATAGRAM_SIZE {
            return Err(CodecError::Malformed("contact list too long"));
        }
        let mut contacts = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            contacts.push(NodeContact::get(u)?);
        }
        Ok(contacts)
    }
}

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::codec::{CodecError, Serializer, Unserializer};
use crate::id::NodeId;

/// Contact information for an overlay node.
///
/// The datagram protocol carries only the id and TCP port in message
/// bodies; the address and UDP port of a sender are always taken from the
/// packet's source endpoint. `user_data` is an opaque value the owner
/// attaches to its node and learns about peers from their PINGs.
#[derive(Debug, Clone, Eq)]
pub struct NodeContact {
    pub id: NodeId,
    pub address: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub user_data: u64,
}

impl NodeContact {
    pub fn new(id: NodeId, address: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        Self {
            id,
            address,
            udp_port,
            tcp_port,
            user_data: 0,
        }
    }

    pub fn udp_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.udp_port)
    }

    pub fn tcp_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.tcp_port)
    }

    pub fn put(&self, s: &mut Serializer) {
        s.put_raw(&self.id.to_le_bytes());
        s.put_str(&self.address.to_string());
        s.put_u16(self.udp_port);
        s.put_u16(self.tcp_port);
    }

    pub fn get(u: &mut Unserializer<'_>) -> Result<Self, CodecError> {
        let id = NodeId::from_le_bytes(u.get_array::<32>()?);
        let address: IpAddr = u
            .get_str()?
            .parse()
            .map_err(|_| CodecError::Malformed("invalid address"))?;
        let udp_port = u.get_u16()?;
        let tcp_port = u.get_u16()?;
        Ok(Self::new(id, address, udp_port, tcp_port))
    }
}

impl Default for NodeContact {
    fn default() -> Self {
        Self::new(NodeId::ZERO, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0)
    }
}

// user_data is advisory and excluded from identity.
impl PartialEq for NodeContact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.address == other.address
            && self.udp_port == other.udp_port
            && self.tcp_port == other.tcp_port
    }
}

impl Hash for NodeContact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeContact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}@{}:{}/{}",
            self.id, self.address, self.udp_port, self.tcp_port
        )
    }
}

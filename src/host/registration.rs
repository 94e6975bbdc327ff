use std::net::IpAddr;

use crate::codec::{CodecError, Serializer, Unserializer};

const ADDR_V4: u8 = 4;
const ADDR_V6: u8 = 6;

/// Body of a Registration packet: the dialer's own view of its reachable
/// endpoint. The accepting side compares it with the socket's observed
/// endpoint to detect NAT and port rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegData {
    pub address: IpAddr,
    pub port: u16,
}

impl RegData {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut s = Serializer::with_capacity(20);
        match self.address {
            IpAddr::V4(v4) => {
                s.put_u8(ADDR_V4);
                s.put_raw(&v4.octets());
            }
            IpAddr::V6(v6) => {
                s.put_u8(ADDR_V6);
                s.put_raw(&v6.octets());
            }
        }
        s.put_u16(self.port);
        s.as_slice().to_vec()
    }

    pub(crate) fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut u = Unserializer::new(data);
        let address = match u.get_u8()? {
            ADDR_V4 => IpAddr::from(u.get_array::<4>()?),
            ADDR_V6 => IpAddr::from(u.get_array::<16>()?),
            _ => return Err(CodecError::Malformed("unknown address type")),
        };
        let port = u.get_u16()?;
        Ok(Self { address, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn v4_round_trip() {
        let reg = RegData {
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            port: 31392,
        };
        assert_eq!(RegData::decode(&reg.encode()).unwrap(), reg);
    }

    #[test]
    fn v6_round_trip() {
        let reg = RegData {
            address: IpAddr::V6(Ipv6Addr::LOCALHOST),
            port: 4242,
        };
        assert_eq!(RegData::decode(&reg.encode()).unwrap(), reg);
    }

    #[test]
    fn junk_is_rejected() {
        assert!(RegData::decode(&[9, 1, 2]).is_err());
        assert!(RegData::decode(&[]).is_err());
    }
}

use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::codec::{CodecError, Serializer, Unserializer};
use crate::id::NodeId;

/// Fixed size of a packet header on the wire:
/// `type + data_size + sender + receiver + reserved`.
pub const HEADER_SIZE: usize = 1 + 8 + 32 + 32 + 4;

/// Refuse to buffer frames beyond this; a larger advertised size is a
/// protocol violation.
pub const MAX_PACKET_DATA_SIZE: usize = 16 * 1024 * 1024;

/// 20-byte content fingerprint used for broadcast deduplication.
pub type PacketId = [u8; 20];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Direct = 0,
    Broadcast = 1,
    Registration = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Direct),
            1 => Ok(PacketType::Broadcast),
            2 => Ok(PacketType::Registration),
            _ => Err(CodecError::Malformed("unknown packet type")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketType,
    pub data_size: usize,
    pub sender: NodeId,
    /// For broadcasts this slot holds the last resender, not a recipient.
    pub receiver: NodeId,
    pub reserved: u32,
}

/// One framed message on a stream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketType, sender: NodeId, receiver: NodeId, data: Vec<u8>) -> Self {
        Self {
            header: PacketHeader {
                kind,
                data_size: data.len(),
                sender,
                receiver,
                reserved: 0,
            },
            data,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.header.kind == PacketType::Direct
    }

    pub fn is_broadcast(&self) -> bool {
        self.header.kind == PacketType::Broadcast
    }

    pub fn is_registration(&self) -> bool {
        self.header.kind == PacketType::Registration
    }

    /// SHA-1 of the payload; identifies a broadcast across relays.
    pub fn fingerprint(&self) -> PacketId {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().into()
    }

    fn put_header(&self, s: &mut Serializer) {
        s.put_u8(self.header.kind as u8);
        s.put_usize(self.data.len());
        s.put_raw(&self.header.sender.to_le_bytes());
        s.put_raw(&self.header.receiver.to_le_bytes());
        s.put_u32(self.header.reserved);
    }

    /// Header followed by the payload, ready to write to a stream.
    pub fn encode(&self) -> Bytes {
        let mut s = Serializer::with_capacity(HEADER_SIZE + self.data.len());
        self.put_header(&mut s);
        s.put_raw(&self.data);
        s.into_bytes()
    }

    /// Decodes a header from exactly [`HEADER_SIZE`] leading bytes.
    /// `data_size` is bounded by [`MAX_PACKET_DATA_SIZE`].
    pub fn decode_header(buf: &[u8]) -> Result<PacketHeader, CodecError> {
        let mut u = Unserializer::new(buf);
        let kind = PacketType::try_from(u.get_u8()?)?;
        let data_size = u.get_usize()?;
        if data_size > MAX_PACKET_DATA_SIZE {
            return Err(CodecError::Malformed("frame too large"));
        }
        let sender = NodeId::from_le_bytes(u.get_array::<32>()?);
        let receiver = NodeId::from_le_bytes(u.get_array::<32>()?);
        let reserved = u.get_u32()?;
        Ok(PacketHeader {
            kind,
            data_size,
            sender,
            receiver,
            reserved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let packet = Packet::new(
            PacketType::Direct,
            NodeId::generate(),
            NodeId::generate(),
            vec![1, 2, 3],
        );
        let encoded = packet.encode();
        assert_eq!(encoded.len(), HEADER_SIZE + 3);

        let header = Packet::decode_header(&encoded[..HEADER_SIZE]).unwrap();
        assert_eq!(header, packet.header);
        assert_eq!(header.data_size, 3);
        assert_eq!(&encoded[HEADER_SIZE..], &[1, 2, 3][..]);
    }

    #[test]
    fn header_data_size_matches_payload() {
        let payload = vec![0u8; 1000];
        let packet = Packet::new(
            PacketType::Broadcast,
            NodeId::generate(),
            NodeId::generate(),
            payload,
        );
        let encoded = packet.encode();
        let header = Packet::decode_header(&encoded).unwrap();
        assert_eq!(header.data_size, encoded.len() - HEADER_SIZE);
    }

    #[test]
    fn invalid_type_is_rejected() {
        let packet = Packet::new(
            PacketType::Direct,
            NodeId::generate(),
            NodeId::generate(),
            Vec::new(),
        );
        let mut encoded = packet.encode().to_vec();
        encoded[0] = 7;
        assert!(Packet::decode_header(&encoded).is_err());
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut s = crate::codec::Serializer::new();
        s.put_u8(PacketType::Direct as u8);
        s.put_usize(MAX_PACKET_DATA_SIZE + 1);
        s.put_raw(&[0u8; 32]);
        s.put_raw(&[0u8; 32]);
        s.put_u32(0);
        assert!(Packet::decode_header(s.as_slice()).is_err());
    }

    #[test]
    fn truncated_header_is_rejected() {
        let packet = Packet::new(
            PacketType::Direct,
            NodeId::generate(),
            NodeId::generate(),
            Vec::new(),
        );
        let encoded = packet.encode();
        assert!(Packet::decode_header(&encoded[..HEADER_SIZE - 1]).is_err());
    }

    #[test]
    fn fingerprint_depends_only_on_payload() {
        let a = Packet::new(
            PacketType::Broadcast,
            NodeId::generate(),
            NodeId::generate(),
            vec![1, 2, 3],
        );
        let b = Packet::new(
            PacketType::Broadcast,
            NodeId::generate(),
            NodeId::generate(),
            vec![1, 2, 3],
        );
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = Packet::new(a.header.kind, a.header.sender, a.header.receiver, vec![4]);
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}

use std::collections::VecDeque;

use super::node::NodeContact;
use crate::id::NodeId;

/// One k-bucket: contacts ordered from least to most recently seen.
///
/// The bucket itself does not enforce the capacity limit; the routing
/// table decides whether to append or to probe the head first.
#[derive(Debug, Default)]
pub struct KBucket {
    nodes: VecDeque<NodeContact>,
}

impl KBucket {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn exists(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.id == id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeContact> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Appends as the most recently seen contact.
    pub fn add_tail(&mut self, contact: NodeContact) {
        self.nodes.push_back(contact);
    }

    /// Moves an existing contact to the most-recently-seen position.
    pub fn promote_to_tail(&mut self, id: &NodeId) {
        if let Some(pos) = self.nodes.iter().position(|n| &n.id == id) {
            if let Some(contact) = self.nodes.remove(pos) {
                self.nodes.push_back(contact);
            }
        }
    }

    pub fn evict(&mut self, id: &NodeId) -> Option<NodeContact> {
        let pos = self.nodes.iter().position(|n| &n.id == id)?;
        self.nodes.remove(pos)
    }

    /// The candidate for liveness probing.
    pub fn least_recent(&self) -> Option<&NodeContact> {
        self.nodes.front()
    }

    /// Replaces a contact's record in place, preserving its position.
    pub fn update(&mut self, contact: NodeContact) {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == contact.id) {
            *existing = contact;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeContact> {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn contact(byte: u8) -> NodeContact {
        let mut bytes = [0u8; 32];
        bytes[0] = byte;
        NodeContact::new(
            NodeId::from_le_bytes(bytes),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            9000,
            9000,
        )
    }

    #[test]
    fn order_is_least_recent_first() {
        let mut bucket = KBucket::default();
        bucket.add_tail(contact(1));
        bucket.add_tail(contact(2));
        assert_eq!(bucket.least_recent(), Some(&contact(1)));

        bucket.promote_to_tail(&contact(1).id);
        assert_eq!(bucket.least_recent(), Some(&contact(2)));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn evict_removes_only_the_target() {
        let mut bucket = KBucket::default();
        bucket.add_tail(contact(1));
        bucket.add_tail(contact(2));

        assert_eq!(bucket.evict(&contact(1).id), Some(contact(1)));
        assert!(bucket.evict(&contact(1).id).is_none());
        assert!(bucket.exists(&contact(2).id));
    }

    #[test]
    fn update_preserves_position() {
        let mut bucket = KBucket::default();
        bucket.add_tail(contact(1));
        bucket.add_tail(contact(2));

        let mut changed = contact(1);
        changed.tcp_port = 4242;
        bucket.update(changed.clone());

        assert_eq!(bucket.least_recent().map(|n| n.tcp_port), Some(4242));
        assert_eq!(bucket.get(&changed.id), Some(&changed));
    }
}

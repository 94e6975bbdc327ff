use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

use crate::id::NodeId;
use crate::stream::{Packet, PacketId};

/// Packets parked for peers without a live connection, bounded by total
/// packet count across all peers. Overflow discards the queue of the peer
/// that has been waiting longest, wholesale.
pub(crate) struct SendQueue {
    max_packets: usize,
    total: usize,
    queues: HashMap<NodeId, Vec<Packet>>,
    order: VecDeque<NodeId>,
}

impl SendQueue {
    pub(crate) fn new(max_packets: usize) -> Self {
        Self {
            max_packets,
            total: 0,
            queues: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, to: NodeId, packet: Packet) {
        if !self.queues.contains_key(&to) {
            self.order.push_back(to);
        }
        self.queues.entry(to).or_default().push(packet);
        self.total += 1;

        while self.total > self.max_packets {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(dropped) = self.queues.remove(&oldest) {
                self.total -= dropped.len();
                warn!(
                    "send queue overflow: discarded {} packets for {:?}",
                    dropped.len(),
                    oldest
                );
            }
        }
    }

    /// Removes and returns everything queued for `id`.
    pub(crate) fn take(&mut self, id: &NodeId) -> Vec<Packet> {
        let Some(queue) = self.queues.remove(id) else {
            return Vec::new();
        };
        self.total -= queue.len();
        self.order.retain(|queued| queued != id);
        queue
    }

    pub(crate) fn clear(&mut self, id: &NodeId) {
        self.take(id);
    }

    pub(crate) fn has(&self, id: &NodeId) -> bool {
        self.queues.contains_key(id)
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }
}

/// Insertion-ordered set of broadcast fingerprints with FIFO eviction.
pub(crate) struct SeenCache {
    cap: usize,
    set: HashSet<PacketId>,
    order: VecDeque<PacketId>,
}

impl SeenCache {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            cap,
            set: HashSet::with_capacity(cap),
            order: VecDeque::with_capacity(cap),
        }
    }

    /// Records a fingerprint. Returns `false` when it was already known.
    pub(crate) fn insert(&mut self, id: PacketId) -> bool {
        if self.set.contains(&id) {
            return false;
        }
        if self.set.len() == self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.set.insert(id);
        self.order.push_back(id);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.set.len()
    }
}

/// Peers that recently refused a dial. Entries expire on read.
pub(crate) struct Unreachable {
    ttl: Duration,
    map: DashMap<NodeId, Instant>,
}

impl Unreachable {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            map: DashMap::new(),
        }
    }

    pub(crate) fn insert(&self, id: NodeId) {
        self.map.insert(id, Instant::now());
    }

    pub(crate) fn contains(&self, id: &NodeId) -> bool {
        self.map.retain(|_, failed_at| failed_at.elapsed() < self.ttl);
        self.map.contains_key(id)
    }

    pub(crate) fn remove(&self, id: &NodeId) {
        self.map.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::PacketType;

    fn packet(n: u8) -> Packet {
        Packet::new(PacketType::Direct, NodeId::ZERO, NodeId::ZERO, vec![n])
    }

    fn id(n: u64) -> NodeId {
        NodeId::from(n)
    }

    #[test]
    fn send_queue_respects_total_bound() {
        let mut queue = SendQueue::new(10);
        for i in 0..10 {
            queue.push(id(i), packet(i as u8));
        }
        assert_eq!(queue.total(), 10);

        queue.push(id(99), packet(0));
        assert!(queue.total() <= 10);
        // the oldest peer's queue is gone, the newest survives
        assert!(!queue.has(&id(0)));
        assert!(queue.has(&id(99)));
    }

    #[test]
    fn send_queue_overflow_discards_whole_peer_queue() {
        let mut queue = SendQueue::new(4);
        queue.push(id(1), packet(1));
        queue.push(id(1), packet(2));
        queue.push(id(1), packet(3));
        queue.push(id(2), packet(4));

        queue.push(id(3), packet(5));
        assert!(!queue.has(&id(1)));
        assert_eq!(queue.total(), 2);
    }

    #[test]
    fn send_queue_take_preserves_order() {
        let mut queue = SendQueue::new(10);
        queue.push(id(1), packet(1));
        queue.push(id(1), packet(2));

        let taken = queue.take(&id(1));
        assert_eq!(taken.iter().map(|p| p.data[0]).collect::<Vec<_>>(), [1, 2]);
        assert_eq!(queue.total(), 0);
        assert!(queue.take(&id(1)).is_empty());
    }

    #[test]
    fn seen_cache_deduplicates() {
        let mut seen = SeenCache::new(100);
        assert!(seen.insert([1u8; 20]));
        assert!(!seen.insert([1u8; 20]));
    }

    #[test]
    fn seen_cache_evicts_fifo_at_capacity() {
        let mut seen = SeenCache::new(3);
        for i in 0..3u8 {
            assert!(seen.insert([i; 20]));
        }
        assert!(seen.insert([3u8; 20]));
        assert_eq!(seen.len(), 3);
        // the oldest entry was evicted and can be inserted anew
        assert!(seen.insert([0u8; 20]));
        // the younger survivors are still present
        assert!(!seen.insert([2u8; 20]));
    }

    #[test]
    fn unreachable_expires_on_read() {
        let unreachable = Unreachable::new(Duration::from_millis(1));
        unreachable.insert(id(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!unreachable.contains(&id(1)));
    }

    #[test]
    fn unreachable_holds_within_ttl() {
        let unreachable = Unreachable::new(Duration::from_secs(60));
        unreachable.insert(id(1));
        assert!(unreachable.contains(&id(1)));
        unreachable.remove(&id(1));
        assert!(!unreachable.contains(&id(1)));
    }
}

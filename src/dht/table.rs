use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::bucket::KBucket;
use super::collector::{FragmentCollector, MAX_FRAGMENT_SIZE};
use super::error::DhtError;
use super::explorer::NetExplorer;
use super::message::{Datagram, Payload};
use super::node::NodeContact;
use super::pinger::Pinger;
use super::socket::DatagramSocket;
use crate::banman::BanMan;
use crate::config::Config;
use crate::id::{FragmentId, NodeId};
use crate::store::FragmentStore;

/// Bucket capacity: chosen so that k nodes are very unlikely to all fail
/// within an hour of each other.
pub const K: usize = 16;

/// One bucket per bit of the id space.
const NUM_BUCKETS: usize = 256;

/// Peers taken per subtree when relaying a broadcast. At `K` this becomes
/// flooding; at 1 a broadcast spreads in log(N) hops but whole subtrees
/// may miss it.
const BROADCAST_REPLICATION: usize = 3;

/// Membership and lookup outcomes, delivered to the host's event pump.
#[derive(Debug, Clone, PartialEq)]
pub enum TableEvent {
    NodeAdded(NodeContact),
    NodeRemoved(NodeContact),
    NodeFound(NodeContact),
    NodeNotFound(NodeId),
    FragmentFound { id: FragmentId, data: Vec<u8> },
    FragmentNotFound(FragmentId),
}

/// Kademlia routing table plus the datagram protocol built on it.
///
/// Owns the UDP socket and the background workers (pinger, explorer,
/// fragment collector). All buckets sit under a single mutex; where the
/// ping map and the buckets are both needed, the ping map is locked first.
pub struct RoutingTable {
    config: Arc<Config>,
    local: NodeContact,
    socket: DatagramSocket,
    ban: Arc<BanMan>,
    buckets: Mutex<Vec<KBucket>>,
    total_nodes: AtomicUsize,
    events: mpsc::UnboundedSender<TableEvent>,
    pinger: Pinger,
    explorer: NetExplorer,
    collector: FragmentCollector,
    shutdown: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoutingTable {
    /// Binds the datagram socket and starts the dispatch and worker tasks.
    ///
    /// `local` is this node's externally visible contact; a zero UDP port
    /// is replaced with the actually bound one.
    pub(crate) async fn spawn(
        config: Arc<Config>,
        mut local: NodeContact,
        ban: Arc<BanMan>,
        store: Arc<dyn FragmentStore>,
        events: mpsc::UnboundedSender<TableEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Self>, DhtError> {
        let bind = SocketAddr::new(config.listen_address, config.listen_port);
        let (socket, recv_rx) = DatagramSocket::bind(bind).await?;
        if local.udp_port == 0 {
            local.udp_port = socket.local_addr()?.port();
        }
        info!("routing table up at {}", local);

        let (collector, lookup_rx) = FragmentCollector::new(store);
        let table = Arc::new(Self {
            config,
            local,
            socket,
            ban,
            buckets: Mutex::new((0..NUM_BUCKETS).map(|_| KBucket::default()).collect()),
            total_nodes: AtomicUsize::new(0),
            events,
            pinger: Pinger::default(),
            explorer: NetExplorer::default(),
            collector,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        let dispatch = tokio::spawn(Self::run_dispatch(Arc::clone(&table), recv_rx));
        let pinger = tokio::spawn(Pinger::run(Arc::clone(&table)));
        let explorer = tokio::spawn(NetExplorer::run(Arc::clone(&table)));
        let lookups = tokio::spawn(FragmentCollector::run_lookups(Arc::clone(&table), lookup_rx));
        let republication = tokio::spawn(FragmentCollector::run_republication(Arc::clone(&table)));
        table
            .tasks
            .lock()
            .extend([dispatch, pinger, explorer, lookups, republication]);

        Ok(table)
    }

    /// Closes the socket and joins the workers. The shutdown latch must
    /// already be flipped so the interval loops exit.
    pub(crate) async fn stop(&self) {
        self.socket.close();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub(crate) fn local(&self) -> &NodeContact {
        &self.local
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(super) fn pinger(&self) -> &Pinger {
        &self.pinger
    }

    pub(super) fn explorer(&self) -> &NetExplorer {
        &self.explorer
    }

    pub(super) fn collector(&self) -> &FragmentCollector {
        &self.collector
    }

    pub(super) fn buckets(&self) -> &Mutex<Vec<KBucket>> {
        &self.buckets
    }

    pub(super) fn inc_node_count(&self) {
        self.total_nodes.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn dec_node_count(&self) {
        self.total_nodes.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn node_count(&self) -> usize {
        self.total_nodes.load(Ordering::Relaxed)
    }

    pub(super) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    pub(super) fn emit(&self, event: TableEvent) {
        let _ = self.events.send(event);
    }

    pub(super) fn send_datagram(&self, to: &NodeContact, payload: &Payload) {
        match Datagram::encode(&self.local, payload) {
            Ok(data) => {
                self.socket.send(to.udp_endpoint(), data);
            }
            Err(e) => debug!("dropping oversize datagram to {}: {}", to, e),
        }
    }

    /// Feeds bootstrap or externally learned contacts into the table. An
    /// empty table starts a lookup for the local id through them; otherwise
    /// each contact is pinged into its bucket.
    pub(crate) fn add_nodes(self: &Arc<Self>, nodes: Vec<NodeContact>) {
        if self.node_count() == 0 {
            self.explorer.find(self, self.local.id, nodes);
        } else {
            for node in nodes {
                if node.id == self.local.id {
                    continue;
                }
                self.pinger.send_ping(self, node, None);
            }
        }
    }

    pub(crate) fn has_node(&self, id: &NodeId) -> Option<NodeContact> {
        let index = self.local.id.bucket_index(id)?;
        self.buckets.lock()[index as usize].get(id).cloned()
    }

    /// Starts an iterative lookup for `id` from the currently known
    /// closest peers.
    pub(crate) fn start_find_node(self: &Arc<Self>, id: NodeId) {
        let nearest = self.nearest(&id);
        self.explorer.find(self, id, nearest);
    }

    /// The table's contents, or the accumulated global view when full-net
    /// discovery is enabled.
    pub(crate) fn known_nodes(&self) -> Vec<NodeContact> {
        if self.config.full_net_discovery {
            return self.explorer.known_nodes();
        }
        let buckets = self.buckets.lock();
        buckets.iter().flat_map(|b| b.iter().cloned()).collect()
    }

    /// Queues a lookup for a fragment; resolution arrives as an event.
    pub(crate) fn find_fragment(&self, id: FragmentId) {
        self.collector.find_fragment(id);
    }

    /// Stores a fragment on the closest known peers (and locally when the
    /// store decision warrants it).
    pub(crate) fn store_fragment(&self, id: FragmentId, fragment: Vec<u8>) -> Result<(), DhtError> {
        if fragment.len() > MAX_FRAGMENT_SIZE {
            return Err(DhtError::FragmentTooLarge(fragment.len()));
        }
        self.collector.store_fragment(self, id, fragment, false);
        Ok(())
    }

    /// Rewrites a tracked peer's TCP port in place.
    pub(crate) fn update_tcp_port(&self, id: &NodeId, port: u16) {
        let Some(index) = self.local.id.bucket_index(id) else {
            return;
        };
        let mut buckets = self.buckets.lock();
        let bucket = &mut buckets[index as usize];
        if let Some(mut updated) = bucket.get(id).cloned() {
            if updated.tcp_port != port {
                updated.tcp_port = port;
                bucket.update(updated);
            }
        }
    }

    /// Records an observation of a live peer: promotes it, appends it, or
    /// probes the bucket head with the peer as a replacement candidate.
    pub(crate) fn update_on_observation(self: &Arc<Self>, contact: NodeContact) {
        if contact.id == self.local.id {
            return;
        }
        let Some(index) = self.local.id.bucket_index(&contact.id) else {
            return;
        };

        let overflow = {
            let mut buckets = self.buckets.lock();
            let bucket = &mut buckets[index as usize];
            if bucket.exists(&contact.id) {
                bucket.promote_to_tail(&contact.id);
                None
            } else if bucket.len() < K {
                bucket.add_tail(contact.clone());
                self.inc_node_count();
                self.emit(TableEvent::NodeAdded(contact));
                None
            } else {
                bucket.least_recent().cloned().map(|head| (head, contact))
            }
        };

        // Bucket lock released: the ping map is locked first by design.
        if let Some((head, candidate)) = overflow {
            self.pinger.send_ping(self, head, Some(candidate));
        }
    }

    /// Up to `K` known peers closest to `target`, closest first. Closeness
    /// is the bucket-index distance; ties keep scan order, so the result
    /// is deterministic for a given table state.
    pub fn nearest(&self, target: &NodeId) -> Vec<NodeContact> {
        let mut heap: BinaryHeap<Ranked> = BinaryHeap::with_capacity(K + 1);
        let buckets = self.buckets.lock();
        let mut seq = 0usize;
        for bucket in buckets.iter() {
            for node in bucket.iter() {
                heap.push(Ranked {
                    key: (distance_key(target, &node.id), seq),
                    contact: node.clone(),
                });
                seq += 1;
                if heap.len() > K {
                    heap.pop();
                }
            }
        }
        drop(buckets);

        let mut ranked = heap.into_vec();
        ranked.sort_by(|a, b| a.key.cmp(&b.key));
        ranked.into_iter().map(|r| r.contact).collect()
    }

    /// Relay targets for a broadcast received from `received_from`: up to
    /// `BROADCAST_REPLICATION` peers from every bucket covering a subtree
    /// closer to the local id than the sender, closest subtree first. For
    /// a locally originated broadcast (or an unknown sender) every bucket
    /// contributes.
    pub fn broadcast_list(&self, received_from: &NodeId) -> Vec<NodeContact> {
        let cutoff = match self.local.id.bucket_index(received_from) {
            Some(index) => index as usize,
            None => NUM_BUCKETS,
        };

        let buckets = self.buckets.lock();
        let mut out = Vec::new();
        for bucket in buckets.iter().take(cutoff) {
            for node in bucket.iter().take(BROADCAST_REPLICATION) {
                out.push(node.clone());
            }
        }
        out
    }

    async fn run_dispatch(
        table: Arc<RoutingTable>,
        mut recv_rx: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
    ) {
        while let Some((src, data)) = recv_rx.recv().await {
            table.handle_packet(src, &data);
        }
    }

    fn handle_packet(self: &Arc<Self>, src: SocketAddr, data: &[u8]) {
        if self.ban.is_banned(src.ip(), src.port()) {
            return;
        }

        let datagram = match Datagram::decode(src, data) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("undecodable datagram from {}: {}", src, e);
                return;
            }
        };

        if !self.check_endpoint(&datagram.from) {
            debug!("endpoint check failed for {}", datagram.from);
            return;
        }

        let Datagram { mut from, payload } = datagram;
        match payload {
            Payload::Ping { user_data } => {
                from.user_data = user_data;
                self.send_datagram(
                    &from,
                    &Payload::Pong {
                        user_data: self.config.host_data,
                    },
                );
                self.update_on_observation(from);
            }
            Payload::Pong { user_data } => {
                from.user_data = user_data;
                if self.pinger.on_pong(&from) {
                    self.update_on_observation(from.clone());
                    self.explorer.on_pong(self, &from);
                }
            }
            Payload::FindNode { target, user_data } => {
                from.user_data = user_data;
                let closest = self.nearest(&target);
                self.send_datagram(
                    &from,
                    &Payload::FindNodes {
                        target,
                        closest,
                        user_data: self.config.host_data,
                    },
                );
                self.update_on_observation(from);
            }
            Payload::FindNodes {
                target,
                closest,
                user_data,
            } => {
                from.user_data = user_data;
                self.explorer.on_find_nodes(self, from, target, closest);
            }
            Payload::FindFragment { target } => {
                self.collector.handle_find_fragment(self, from, target)
            }
            Payload::FragmentFound { target, fragment } => {
                self.collector.on_fragment_found(self, target, fragment)
            }
            Payload::FragmentNotFound { target, closest } => {
                self.collector.on_fragment_not_found(self, from.id, target, closest)
            }
            Payload::Store { id, fragment } => self.collector.handle_store(id, fragment),
        }
    }

    /// A datagram claiming the local id, or claiming a tracked id from the
    /// wrong endpoint, is discarded.
    fn check_endpoint(&self, from: &NodeContact) -> bool {
        if from.id == self.local.id {
            return false;
        }
        match self.has_node(&from.id) {
            Some(existing) => {
                existing.address == from.address && existing.udp_port == from.udp_port
            }
            None => true,
        }
    }
}

/// Sort key for closeness of `id` to `target`: lower is closer; the
/// target itself sorts before everything else.
fn distance_key(target: &NodeId, id: &NodeId) -> i32 {
    match target.bucket_index(id) {
        Some(index) => index as i32,
        None => -1,
    }
}

struct Ranked {
    key: (i32, usize),
    contact: NodeContact,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key.cmp(&other.key)
    }
}

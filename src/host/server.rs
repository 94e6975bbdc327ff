use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::queue::{SeenCache, SendQueue, Unreachable};
use super::registration::RegData;
use super::Event;
use crate::banman::{BanEntry, BanMan};
use crate::config::Config;
use crate::dht::{NodeContact, RoutingTable, TableEvent};
use crate::error::KadError;
use crate::id::{FragmentId, NodeId};
use crate::store::FragmentStore;
use crate::stream::{ConnEvent, Connection, ConnectionHandle, DropReason, Packet, PacketType};

/// Total packets parked across all peers awaiting a connection.
const MAX_SEND_QUEUE_PACKETS: usize = 1000;

/// Broadcast fingerprints remembered for deduplication.
const MAX_BROADCAST_IDS: usize = 10_000;

/// The overlay node: owns the routing table, the TCP listener and every
/// stream connection, and funnels all outcomes into one event channel.
///
/// All methods are callable from any task. Internal maps each have their
/// own lock; paths that need the ping and routing locks take them in that
/// order, and no lock is held across an await point.
pub struct Host {
    config: Arc<Config>,
    local: NodeContact,
    routing: Arc<RoutingTable>,
    ban: Arc<BanMan>,
    events: mpsc::UnboundedSender<Event>,
    conn_tx: mpsc::UnboundedSender<ConnEvent>,
    connections: Mutex<HashMap<NodeId, Vec<ConnectionHandle>>>,
    pending: Mutex<HashSet<NodeId>>,
    unreachable: Unreachable,
    send_queue: Mutex<SendQueue>,
    seen: Mutex<SeenCache>,
    /// Peers whose registration disagreed with their observed address.
    nat_peers: Mutex<HashSet<NodeId>>,
    reg_data: Vec<u8>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Host {
    /// Binds the sockets, starts the background workers and returns the
    /// host together with its event stream.
    ///
    /// The host lives on the calling tokio runtime; its methods may be
    /// invoked from any task of that runtime.
    pub async fn spawn(
        config: Config,
        store: Arc<dyn FragmentStore>,
    ) -> Result<(Arc<Host>, mpsc::UnboundedReceiver<Event>), KadError> {
        let config = Arc::new(config);

        let advertised: IpAddr = if config.listen_address.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            config.listen_address
        };

        let listener =
            TcpListener::bind(SocketAddr::new(config.listen_address, config.listen_port)).await?;
        let tcp_port = listener.local_addr()?.port();
        info!("listening for stream connections on port {}", tcp_port);

        let ban = Arc::new(BanMan::open(config.ban_file.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (table_tx, table_rx) = mpsc::unbounded_channel();

        let mut local = NodeContact::new(config.id, advertised, config.listen_port, tcp_port);
        local.user_data = config.host_data;
        let routing = RoutingTable::spawn(
            Arc::clone(&config),
            local,
            Arc::clone(&ban),
            store,
            table_tx,
            shutdown_rx,
        )
        .await?;
        let local = routing.local().clone();

        let reg_data = RegData {
            address: advertised,
            port: tcp_port,
        }
        .encode();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        let host = Arc::new(Host {
            config: Arc::clone(&config),
            local,
            routing,
            ban,
            events: event_tx,
            conn_tx,
            connections: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            unreachable: Unreachable::new(config.unreachable_ttl),
            send_queue: Mutex::new(SendQueue::new(MAX_SEND_QUEUE_PACKETS)),
            seen: Mutex::new(SeenCache::new(MAX_BROADCAST_IDS)),
            nat_peers: Mutex::new(HashSet::new()),
            reg_data,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let accept = tokio::spawn(Self::run_accept(Arc::clone(&host), listener));
        let table_pump = tokio::spawn(Self::run_table_events(Arc::clone(&host), table_rx));
        let conn_pump = tokio::spawn(Self::run_conn_events(Arc::clone(&host), conn_rx));
        host.tasks.lock().extend([accept, table_pump, conn_pump]);

        Ok((host, event_rx))
    }

    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    /// This node's externally advertised contact.
    pub fn contact(&self) -> &NodeContact {
        &self.local
    }

    /// Flips the shutdown latch, stops the routing table and its workers,
    /// drops every connection and joins the host tasks.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.routing.stop().await;

        let all: Vec<ConnectionHandle> = {
            let mut connections = self.connections.lock();
            connections.drain().flat_map(|(_, list)| list).collect()
        };
        for conn in all {
            conn.close_silently();
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    // --- messaging -------------------------------------------------------

    /// Sends `payload` to `to` over a stream connection, dialing or
    /// resolving the peer first when necessary. Sending to the local id is
    /// a no-op.
    pub fn send_direct(&self, to: NodeId, payload: Vec<u8>) {
        if to == self.local.id {
            return;
        }
        let packet = Packet::new(PacketType::Direct, self.local.id, to, payload);
        if let Some(conn) = self.connection_for(&to) {
            conn.send(&packet);
            return;
        }

        self.send_queue.lock().push(to, packet);
        match self.routing.has_node(&to) {
            Some(contact) => self.connect_to(&contact),
            None => self.routing.start_find_node(to),
        }
    }

    /// Disseminates `payload` across the overlay along the broadcast tree.
    /// The local node never re-receives its own broadcast.
    pub fn send_broadcast(&self, payload: Vec<u8>) {
        let packet = Packet::new(PacketType::Broadcast, self.local.id, self.local.id, payload);
        self.seen.lock().insert(packet.fingerprint());
        for contact in self.routing.broadcast_list(&self.local.id) {
            self.send_packet_to(&contact, packet.clone());
        }
    }

    /// Direct when a connection exists; otherwise broadcast now and start
    /// resolving `to` for future direct traffic.
    pub fn send_broadcast_if_no_connection(&self, to: NodeId, payload: Vec<u8>) {
        if let Some(conn) = self.connection_for(&to) {
            conn.send(&Packet::new(PacketType::Direct, self.local.id, to, payload));
            return;
        }

        self.send_broadcast(payload);
        match self.routing.has_node(&to) {
            Some(contact) => self.connect_to(&contact),
            None => self.routing.start_find_node(to),
        }
    }

    // --- membership ------------------------------------------------------

    /// Feeds bootstrap or externally learned contacts to the routing table.
    pub fn add_known_nodes(&self, nodes: Vec<NodeContact>) {
        self.routing.add_nodes(nodes);
    }

    pub fn known_nodes(&self) -> Vec<NodeContact> {
        self.routing.known_nodes()
    }

    // --- fragments -------------------------------------------------------

    /// Stores a fragment on the closest peers (and locally when the store
    /// decision warrants it).
    pub fn store_fragment(&self, id: FragmentId, data: Vec<u8>) -> Result<(), KadError> {
        self.routing.store_fragment(id, data)?;
        Ok(())
    }

    /// Resolves a fragment; the outcome arrives as [`Event::FragmentFound`]
    /// or [`Event::FragmentNotFound`].
    pub fn find_fragment(&self, id: FragmentId) {
        self.routing.find_fragment(id);
    }

    // --- bans ------------------------------------------------------------

    /// Bans a peer by id. An unknown contact is resolved through a lookup
    /// first; the ban lands when the lookup reports the node found.
    pub fn ban(&self, id: NodeId) {
        if id == self.local.id {
            return;
        }
        match self.routing.has_node(&id) {
            Some(contact) => {
                self.ban.ban(contact.address, contact.tcp_port, Some(id));
                self.on_id_banned(&id);
            }
            None => {
                self.ban.add_waiting(id);
                self.routing.start_find_node(id);
            }
        }
    }

    /// Removes every ban recorded under `id`.
    pub fn unban(&self, id: NodeId) {
        self.ban.unban_id(&id);
    }

    pub fn ban_endpoint(&self, address: IpAddr, port: u16) {
        self.ban.ban(address, port, None);
    }

    pub fn unban_endpoint(&self, address: IpAddr, port: u16) {
        self.ban.unban(address, port);
    }

    pub fn clear_ban_list(&self) {
        self.ban.clear();
    }

    pub fn ban_list(&self) -> Vec<BanEntry> {
        self.ban.banned()
    }

    /// Peers whose registration revealed a NAT between us.
    pub fn nat_peers(&self) -> Vec<NodeId> {
        self.nat_peers.lock().iter().copied().collect()
    }

    // --- internals -------------------------------------------------------

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn connection_for(&self, id: &NodeId) -> Option<ConnectionHandle> {
        self.connections
            .lock()
            .get(id)?
            .iter()
            .find(|conn| !conn.is_dropped())
            .cloned()
    }

    fn registration_packet(&self, receiver: NodeId) -> Packet {
        Packet::new(
            PacketType::Registration,
            self.local.id,
            receiver,
            self.reg_data.clone(),
        )
    }

    /// Routes a packet to a contact: straight onto a live connection, or
    /// parked in the send queue behind a dial.
    fn send_packet_to(&self, contact: &NodeContact, packet: Packet) {
        if let Some(conn) = self.connection_for(&contact.id) {
            conn.send(&packet);
            return;
        }
        self.send_queue.lock().push(contact.id, packet);
        self.connect_to(contact);
    }

    /// Dial policy: banned endpoints, recently unreachable peers and
    /// already-pending dials are all skipped.
    fn connect_to(&self, contact: &NodeContact) {
        if contact.id == self.local.id {
            return;
        }
        if self.ban.is_banned(contact.address, contact.tcp_port) {
            debug!("not dialing banned endpoint {}", contact);
            self.send_queue.lock().clear(&contact.id);
            return;
        }
        if self.unreachable.contains(&contact.id) {
            debug!("not dialing recently unreachable peer {}", contact);
            return;
        }
        if !self.pending.lock().insert(contact.id) {
            return;
        }

        Connection::connect(
            contact.tcp_endpoint(),
            contact.id,
            self.registration_packet(contact.id),
            self.conn_tx.clone(),
            self.config.idle_timeout,
        );
    }

    fn on_connected(&self, conn: ConnectionHandle, reg_packet: Packet) {
        let remote = conn.remote();

        if conn.is_active() {
            self.pending.lock().remove(&remote);
        } else {
            let observed = conn.peer_addr();
            match RegData::decode(&reg_packet.data) {
                Ok(reg) => {
                    // A dialer whose own view of its endpoint differs from
                    // what we observe sits behind a NAT; reach it through
                    // the mapping we actually saw.
                    if reg.address != observed.ip() {
                        if reg.port != observed.port() {
                            self.routing.update_tcp_port(&remote, observed.port());
                        }
                        self.nat_peers.lock().insert(remote);
                    }
                }
                Err(e) => debug!("unreadable registration data from {:?}: {}", remote, e),
            }
            conn.send(&self.registration_packet(remote));
        }

        self.unreachable.remove(&remote);

        {
            let mut connections = self.connections.lock();
            let list = connections.entry(remote).or_default();
            if let Some(pos) = list.iter().position(|c| c.is_active() == conn.is_active()) {
                let old = list.remove(pos);
                old.close_silently();
                debug!("replaced duplicate {} connection to {:?}",
                    if conn.is_active() { "active" } else { "passive" }, remote);
            }
            list.push(conn.clone());
        }

        let parked = self.send_queue.lock().take(&remote);
        for packet in parked {
            conn.send(&packet);
        }
    }

    fn on_packet(&self, from: NodeId, packet: Packet) {
        if packet.is_direct() {
            if packet.header.receiver == self.local.id {
                self.emit(Event::MessageReceived {
                    from: packet.header.sender,
                    payload: packet.data,
                });
            }
            return;
        }

        if packet.is_broadcast() {
            if !self.seen.lock().insert(packet.fingerprint()) {
                return; // already relayed and delivered
            }

            let mut relay = packet.clone();
            relay.header.receiver = self.local.id;
            for contact in self.routing.broadcast_list(&from) {
                self.send_packet_to(&contact, relay.clone());
            }

            self.emit(Event::MessageReceived {
                from: packet.header.sender,
                payload: packet.data,
            });
        }
    }

    fn on_dropped(&self, remote: NodeId, active: bool, reason: DropReason) {
        debug!("connection to {:?} dropped: {}", remote, reason);
        let last_gone = {
            let mut connections = self.connections.lock();
            match connections.get_mut(&remote) {
                Some(list) => {
                    list.retain(|conn| conn.is_active() != active);
                    if list.is_empty() {
                        connections.remove(&remote);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last_gone {
            self.send_queue.lock().clear(&remote);
        }
        if !active {
            self.nat_peers.lock().remove(&remote);
        }

        self.emit(Event::ConnectionDropped {
            peer: remote,
            reason,
        });
    }

    fn on_pending_error(&self, remote: NodeId, reason: DropReason) {
        debug!("pending connection to {:?} failed: {}", remote, reason);
        if matches!(reason, DropReason::ConnectionError | DropReason::Timeout) {
            self.unreachable.insert(remote);
        }
        self.send_queue.lock().clear(&remote);
        self.pending.lock().remove(&remote);
    }

    /// A banned peer keeps no live connection, parked packets or pending
    /// dial.
    fn on_id_banned(&self, id: &NodeId) {
        if let Some(list) = self.connections.lock().remove(id) {
            for conn in list {
                conn.close_silently();
            }
        }
        self.send_queue.lock().clear(id);
        self.pending.lock().remove(id);
    }

    async fn run_accept(host: Arc<Host>, listener: TcpListener) {
        let mut shutdown = host.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        if host.ban.is_address_banned(peer.ip()) {
                            debug!("rejecting accept from banned address {}", peer);
                            continue;
                        }
                        Connection::accept(
                            stream,
                            host.conn_tx.clone(),
                            host.config.idle_timeout,
                        );
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                    }
                },
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn run_conn_events(host: Arc<Host>, mut rx: mpsc::UnboundedReceiver<ConnEvent>) {
        let mut shutdown = host.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }
        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };

            match event {
                ConnEvent::Connected { conn, packet } => host.on_connected(conn, packet),
                ConnEvent::PacketReceived { from, packet } => host.on_packet(from, packet),
                ConnEvent::Dropped {
                    remote,
                    active,
                    reason,
                } => host.on_dropped(remote, active, reason),
                ConnEvent::PendingError { remote, reason } => {
                    host.on_pending_error(remote, reason)
                }
            }
        }
    }

    async fn run_table_events(host: Arc<Host>, mut rx: mpsc::UnboundedReceiver<TableEvent>) {
        let mut shutdown = host.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }
        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };

            match event {
                TableEvent::NodeAdded(contact) => host.emit(Event::NodeDiscovered(contact)),
                TableEvent::NodeRemoved(contact) => host.emit(Event::NodeRemoved(contact)),
                TableEvent::NodeFound(contact) => {
                    if host.ban.take_waiting(&contact.id) {
                        host.ban
                            .ban(contact.address, contact.tcp_port, Some(contact.id));
                        host.on_id_banned(&contact.id);
                    } else if host.send_queue.lock().has(&contact.id) {
                        host.connect_to(&contact);
                    }
                    host.emit(Event::NodeFound(contact));
                }
                TableEvent::NodeNotFound(id) => {
                    host.ban.take_waiting(&id);
                    host.emit(Event::NodeNotFound(id));
                }
                TableEvent::FragmentFound { id, data } => {
                    host.emit(Event::FragmentFound { id, data })
                }
                TableEvent::FragmentNotFound(id) => host.emit(Event::FragmentNotFound(id)),
            }
        }
    }
}

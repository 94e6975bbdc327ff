use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::message::Payload;
use super::node::NodeContact;
use super::table::{RoutingTable, TableEvent, K};
use crate::id::{FragmentId, NodeId};
use crate::store::FragmentStore;

/// Largest fragment a STORE datagram can carry, leaving room for the
/// datagram envelope within the MTU.
pub const MAX_FRAGMENT_SIZE: usize = 1350;

/// Fragment lookup, storage and republication.
///
/// Lookups are fed through a channel to a worker that checks local
/// persistence first and escalates to the network on a miss. Network
/// lookups keep a per-target set of visited responders and expire through
/// a tombstone timer. A republication loop re-runs the store decision for
/// every locally held fragment once per interval.
pub(super) struct FragmentCollector {
    store: Arc<dyn FragmentStore>,
    lookup_tx: mpsc::UnboundedSender<FragmentId>,
    /// Targets queued for the local-lookup worker.
    required: Mutex<HashSet<FragmentId>>,
    /// In-flight network lookups and the responders already heard from.
    net_required: Mutex<HashMap<FragmentId, HashSet<NodeId>>>,
    /// Locally held fragments and their last republication instant.
    stored: DashMap<FragmentId, Instant>,
}

impl FragmentCollector {
    pub(super) fn new(
        store: Arc<dyn FragmentStore>,
    ) -> (Self, mpsc::UnboundedReceiver<FragmentId>) {
        let (lookup_tx, lookup_rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                lookup_tx,
                required: Mutex::new(HashSet::new()),
                net_required: Mutex::new(HashMap::new()),
                stored: DashMap::new(),
            },
            lookup_rx,
        )
    }

    /// Queues a fragment lookup; duplicates collapse while queued.
    pub(super) fn find_fragment(&self, id: FragmentId) {
        if self.required.lock().insert(id) {
            let _ = self.lookup_tx.send(id);
        }
    }

    /// Runs the store decision for `(id, fragment)`.
    ///
    /// Fewer than K known peers keeps a local copy. Otherwise, when this
    /// node is closer to `id` than the farthest candidate, that candidate
    /// is dropped from the outbound list and the copy stays local. With
    /// `remove_own` a copy that is no longer warranted is deleted.
    /// Returns whether the fragment is held locally afterwards.
    pub(super) fn store_fragment(
        &self,
        table: &RoutingTable,
        id: FragmentId,
        fragment: Vec<u8>,
        remove_own: bool,
    ) -> bool {
        let mut nearest = table.nearest(&id);
        let mut keep_own = false;

        if nearest.len() < K {
            keep_own = true;
        } else {
            let my_rank = rank(&id, &table.local().id);
            if nearest.iter().any(|node| rank(&id, &node.id) < my_rank) {
                nearest.pop(); // farthest candidate yields to the local copy
                keep_own = true;
            }
        }

        if keep_own && !remove_own {
            if let Err(e) = self.write_local(&id, &fragment) {
                warn!("failed to persist fragment {:?}: {}", id, e);
                keep_own = false;
            }
        }

        if remove_own {
            if keep_own {
                self.stored.insert(id, Instant::now());
            } else {
                self.store.remove(&id.to_le_bytes());
                self.stored.remove(&id);
            }
        }

        let payload = Payload::Store {
            id,
            fragment,
        };
        for node in &nearest {
            table.send_datagram(node, &payload);
        }

        keep_own
    }

    fn write_local(&self, id: &FragmentId, fragment: &[u8]) -> Result<(), crate::store::StoreError> {
        self.store.write(&id.to_le_bytes(), fragment)?;
        self.stored.insert(*id, Instant::now());
        Ok(())
    }

    fn start_find_in_network(&self, table: &Arc<RoutingTable>, id: FragmentId) {
        self.net_required.lock().entry(id).or_default();

        let payload = Payload::FindFragment { target: id };
        for node in table.nearest(&id) {
            table.send_datagram(&node, &payload);
        }

        let table = Arc::clone(table);
        tokio::spawn(async move {
            tokio::time::sleep(table.config().lookup_timeout).await;
            let expired = table
                .collector()
                .net_required
                .lock()
                .remove(&id)
                .is_some();
            if expired {
                table.emit(TableEvent::FragmentNotFound(id));
            }
        });
    }

    /// Serves a FIND_FRAGMENT request.
    pub(super) fn handle_find_fragment(
        &self,
        table: &Arc<RoutingTable>,
        from: NodeContact,
        target: FragmentId,
    ) {
        let reply = match self.store.read(&target.to_le_bytes()) {
            Some(fragment) => Payload::FragmentFound { target, fragment },
            None => Payload::FragmentNotFound {
                target,
                closest: table.nearest(&target),
            },
        };
        table.send_datagram(&from, &reply);
        table.update_on_observation(from);
    }

    /// Serves a STORE request.
    pub(super) fn handle_store(&self, id: FragmentId, fragment: Vec<u8>) {
        if let Err(e) = self.write_local(&id, &fragment) {
            warn!("failed to persist stored fragment {:?}: {}", id, e);
        }
    }

    pub(super) fn on_fragment_found(
        &self,
        table: &RoutingTable,
        target: FragmentId,
        fragment: Vec<u8>,
    ) {
        if self.net_required.lock().remove(&target).is_some() {
            table.emit(TableEvent::FragmentFound {
                id: target,
                data: fragment,
            });
        }
    }

    pub(super) fn on_fragment_not_found(
        &self,
        table: &RoutingTable,
        responder: NodeId,
        target: FragmentId,
        closest: Vec<NodeContact>,
    ) {
        let next: Vec<_> = {
            let mut net_required = self.net_required.lock();
            let Some(visited) = net_required.get_mut(&target) else {
                return; // lookup expired or resolved
            };
            visited.insert(responder);
            closest
                .into_iter()
                .filter(|n| !visited.contains(&n.id))
                .collect()
        };

        let payload = Payload::FindFragment { target };
        for node in &next {
            table.send_datagram(node, &payload);
        }
    }

    /// Local-lookup worker: local hit emits directly, miss escalates to
    /// the network.
    pub(super) async fn run_lookups(
        table: Arc<RoutingTable>,
        mut lookup_rx: mpsc::UnboundedReceiver<FragmentId>,
    ) {
        let mut shutdown = table.shutdown_signal();
        if *shutdown.borrow() {
            return;
        }
        loop {
            let id = tokio::select! {
                id = lookup_rx.recv() => match id {
                    Some(id) => id,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };

            let collector = table.collector();
            collector.required.lock().remove(&id);

            match collector.store.read(&id.to_le_bytes()) {
                Some(data) => table.emit(TableEvent::FragmentFound { id, data }),
                None => collector.start_find_in_network(&table, id),
            }
        }
    }

    /// Republication loop. Seeds the timestamp map from persisted keys,
    /// then periodically re-runs the store decision for fragments that
    /// have sat unchanged for a full interval.
    pub(super) async fn run_republication(table: Arc<RoutingTable>) {
        let collector = table.collector();
        let now = Instant::now();
        for key in collector.store.keys() {
            collector.stored.insert(NodeId::from_le_bytes(key), now);
        }

        let mut shutdown = table.shutdown_signal();
        if *shutdown.borrow() {
            return;
        }
        let interval = table.config().republication_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let due: Vec<FragmentId> = collector
                .stored
                .iter()
                .filter(|entry| entry.value().elapsed() >= interval)
                .map(|entry| *entry.key())
                .collect();

            for id in due {
                match collector.store.read(&id.to_le_bytes()) {
                    Some(fragment) => {
                        if !collector.store_fragment(&table, id, fragment, true) {
                            debug!("fragment {:?} handed off during republication", id);
                        }
                    }
                    None => {
                        collector.stored.remove(&id);
                    }
                }
            }
        }
    }
}

/// Closeness of `id` to `target`: higher ranks are closer. Equality is the
/// closest possible rank.
fn rank(target: &NodeId, id: &NodeId) -> i32 {
    match target.bucket_index(id) {
        Some(index) => 255 - index as i32,
        None => 256,
    }
}

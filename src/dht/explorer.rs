use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::message::Payload;
use super::node::NodeContact;
use super::table::{RoutingTable, TableEvent};
use crate::id::NodeId;

/// Interval at which the accumulated known-node view is folded, when
/// full-net discovery is enabled.
const UPDATE_NODES_INTERVAL: Duration = Duration::from_secs(60 * 10);

#[derive(Default)]
struct KnownNodes {
    actual: HashSet<NodeContact>,
    updates: HashSet<NodeContact>,
}

/// Iterative node lookup and periodic network discovery.
///
/// One entry per in-flight target records every peer already queried;
/// responses from unqueried peers (or for unknown targets) are discarded.
/// A lookup resolves to *NodeFound* only after the target itself answers a
/// confirmatory PING; a tombstone timer resolves it to *NodeNotFound*.
#[derive(Default)]
pub(super) struct NetExplorer {
    sent: Mutex<HashMap<NodeId, HashSet<NodeId>>>,
    known: Mutex<KnownNodes>,
}

impl NetExplorer {
    /// Starts an iterative lookup for `target`, querying `find_list`.
    /// A lookup already in flight for the same target is left alone.
    pub(super) fn find(&self, table: &Arc<RoutingTable>, target: NodeId, find_list: Vec<NodeContact>) {
        {
            let mut sent = self.sent.lock();
            if sent.get(&target).is_some_and(|queried| !queried.is_empty()) {
                debug!("lookup for {:?} already in progress", target);
                return;
            }

            let queried = sent.entry(target).or_default();
            for node in &find_list {
                queried.insert(node.id);
            }
        }

        let payload = Payload::FindNode {
            target,
            user_data: table.config().host_data,
        };
        for node in &find_list {
            table.send_datagram(node, &payload);
        }

        let table = Arc::clone(table);
        tokio::spawn(async move {
            tokio::time::sleep(table.config().lookup_timeout).await;
            if table.explorer().sent.lock().remove(&target).is_some() {
                table.emit(TableEvent::NodeNotFound(target));
            }
        });
    }

    /// Handles a FIND_NODES response.
    pub(super) fn on_find_nodes(
        &self,
        table: &Arc<RoutingTable>,
        from: NodeContact,
        target: NodeId,
        closest: Vec<NodeContact>,
    ) {
        if table.config().full_net_discovery {
            let mut known = self.known.lock();
            known.updates.insert(from.clone());
            for node in &closest {
                known.updates.insert(node.clone());
            }
        }

        let found = {
            let mut sent = self.sent.lock();
            let Some(queried) = sent.get_mut(&target) else {
                return; // lookup expired or never started
            };
            if !queried.contains(&from.id) {
                debug!("unexpected find-node response from {}", from);
                return;
            }

            table.update_on_observation(from);

            match closest.iter().find(|n| n.id == target) {
                Some(found) => Some(found.clone()),
                None => {
                    let payload = Payload::FindNode {
                        target,
                        user_data: table.config().host_data,
                    };
                    for node in &closest {
                        if node.id == table.local().id || queried.contains(&node.id) {
                            continue;
                        }
                        queried.insert(node.id);
                        table.send_datagram(node, &payload);
                    }
                    None
                }
            }
        };

        // Reachability of the located target is verified by a PING; the
        // lookup resolves when its PONG arrives.
        if let Some(found) = found {
            if found.id != table.local().id {
                table.pinger().send_ping(table, found, None);
            }
        }
    }

    /// Called for every solicited PONG: a pending lookup for the sender's
    /// own id resolves to *NodeFound*.
    pub(super) fn on_pong(&self, table: &RoutingTable, from: &NodeContact) {
        if self.sent.lock().remove(&from.id).is_some() {
            table.emit(TableEvent::NodeFound(from.clone()));
        }
    }

    /// The accumulated known-node view (full-net discovery only).
    pub(super) fn known_nodes(&self) -> Vec<NodeContact> {
        self.known.lock().actual.iter().cloned().collect()
    }

    /// Random-id discovery loop.
    pub(super) async fn run(table: Arc<RoutingTable>) {
        let mut shutdown = table.shutdown_signal();
        if *shutdown.borrow() {
            return;
        }
        let mut discovery = tokio::time::interval(table.config().discovery_interval);
        discovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        discovery.tick().await;

        let mut fold = tokio::time::interval(UPDATE_NODES_INTERVAL);
        fold.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        fold.tick().await;

        loop {
            tokio::select! {
                _ = discovery.tick() => {
                    let target = NodeId::generate();
                    let nearest = table.nearest(&target);
                    table.explorer().find(&table, target, nearest);
                }
                _ = fold.tick(), if table.config().full_net_discovery => {
                    let mut known = table.explorer().known.lock();
                    let updates = std::mem::take(&mut known.updates);
                    known.actual.extend(updates);
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

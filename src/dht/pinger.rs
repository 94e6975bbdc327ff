use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::message::Payload;
use super::node::NodeContact;
use super::table::{RoutingTable, TableEvent};
use crate::id::NodeId;

/// Pings issued for one peer before it is declared dead.
pub(super) const MAX_PINGS_BEFORE_REMOVE: u8 = 3;

/// Liveness prober.
///
/// A background loop walks the buckets round-robin, pinging every member
/// of one non-empty bucket per tick. Each outstanding ping carries a send
/// counter; a missing PONG within the ping interval either resends or, at
/// the limit, evicts the peer (installing a replacement candidate if the
/// ping was triggered by bucket overflow).
///
/// Lock order: the ping map is always taken before the bucket mutex.
#[derive(Default)]
pub(super) struct Pinger {
    sent: Mutex<HashMap<NodeId, u8>>,
}

impl Pinger {
    /// Sends a PING and arms its expiry.
    ///
    /// With `replacement` present the counter starts exhausted, so a single
    /// unanswered expiry evicts the probed head and admits the candidate.
    pub(super) fn send_ping(
        &self,
        table: &Arc<RoutingTable>,
        target: NodeContact,
        replacement: Option<NodeContact>,
    ) {
        {
            let mut sent = self.sent.lock();
            let count = sent.entry(target.id).or_insert(if replacement.is_some() {
                MAX_PINGS_BEFORE_REMOVE
            } else {
                0
            });
            *count = count.saturating_add(1);
        }

        table.send_datagram(
            &target,
            &Payload::Ping {
                user_data: table.config().host_data,
            },
        );

        let table = Arc::clone(table);
        tokio::spawn(async move {
            tokio::time::sleep(table.config().ping_interval).await;
            table.pinger().on_ping_expired(&table, target, replacement);
        });
    }

    fn on_ping_expired(
        &self,
        table: &Arc<RoutingTable>,
        target: NodeContact,
        replacement: Option<NodeContact>,
    ) {
        {
            let mut sent = self.sent.lock();
            let count = match sent.get(&target.id) {
                Some(count) => *count,
                None => return, // answered in time
            };

            if count >= MAX_PINGS_BEFORE_REMOVE {
                sent.remove(&target.id);

                // ping lock held; bucket mutex nests inside it.
                let mut buckets = table.buckets().lock();
                if let Some(index) = table.local().id.bucket_index(&target.id) {
                    let bucket = &mut buckets[index as usize];
                    if bucket.evict(&target.id).is_some() {
                        table.dec_node_count();
                        table.emit(TableEvent::NodeRemoved(target.clone()));
                        debug!("evicted unresponsive peer {}", target);
                    }
                    if let Some(candidate) = replacement {
                        bucket.add_tail(candidate.clone());
                        table.inc_node_count();
                        table.emit(TableEvent::NodeAdded(candidate));
                    }
                }
                return;
            }
        }

        self.send_ping(table, target, replacement);
    }

    /// Clears the pending entry for a PONG sender. Returns whether the
    /// PONG was solicited; unsolicited ones are ignored by the caller.
    pub(super) fn on_pong(&self, from: &NodeContact) -> bool {
        self.sent.lock().remove(&from.id).is_some()
    }

    /// Background probe loop: one non-empty bucket per tick, plus the
    /// bootstrap feed while the table is empty.
    pub(super) async fn run(table: Arc<RoutingTable>) {
        let mut shutdown = table.shutdown_signal();
        if *shutdown.borrow() {
            return;
        }
        let mut interval = tokio::time::interval(table.config().ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        let mut cursor = 0usize;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => return,
            }

            if table.node_count() == 0 {
                let boot = table.config().boot_nodes();
                if !boot.is_empty() {
                    table.add_nodes(boot);
                }
                continue;
            }

            let members = {
                let buckets = table.buckets().lock();
                let mut found = None;
                for _ in 0..buckets.len() {
                    if cursor >= buckets.len() {
                        cursor = 0;
                    }
                    if !buckets[cursor].is_empty() {
                        found = Some(buckets[cursor].iter().cloned().collect::<Vec<_>>());
                        cursor += 1;
                        break;
                    }
                    cursor += 1;
                }
                found
            };

            if let Some(members) = members {
                for member in members {
                    table.pinger().send_ping(&table, member, None);
                }
            }
        }
    }
}

//! Ban list.
//!
//! Bans are keyed by endpoint; a port of zero bans every port on the
//! address. The list is mirrored to a text file (one `<address>:<port>`
//! line per entry, sorted) on every mutation and reloaded on open. Bans
//! addressed by node id when the contact is not yet known are parked in a
//! queue until a lookup resolves them.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::id::NodeId;

/// A banned endpoint. Port zero matches every port on the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BanEntry {
    pub address: IpAddr,
    pub port: u16,
}

pub struct BanMan {
    path: PathBuf,
    banned: Mutex<BTreeMap<BanEntry, Option<NodeId>>>,
    /// Ids waiting for a lookup before their ban can apply.
    queue: Mutex<HashSet<NodeId>>,
}

impl BanMan {
    /// Opens the ban list, seeding from `path` if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let this = Self {
            path: path.into(),
            banned: Mutex::new(BTreeMap::new()),
            queue: Mutex::new(HashSet::new()),
        };
        this.seed_from_file();
        this
    }

    fn seed_from_file(&self) {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return;
        };

        let mut banned = self.banned.lock();
        for line in content.lines() {
            // A corrupt line silently aborts the rest of the load.
            let Some((addr, port)) = line.rsplit_once(':') else {
                return;
            };
            let (Ok(address), Ok(port)) = (addr.parse::<IpAddr>(), port.parse::<u16>()) else {
                return;
            };
            banned.insert(BanEntry { address, port }, None);
        }
    }

    fn dump_to_file(&self, banned: &BTreeMap<BanEntry, Option<NodeId>>) {
        let mut content = String::new();
        for entry in banned.keys() {
            content.push_str(&format!("{}:{}\n", entry.address, entry.port));
        }
        if let Err(e) = fs::write(&self.path, content) {
            warn!("failed to persist ban list: {}", e);
        }
    }

    /// Whether `(address, port)` is banned, honoring port-zero wildcards
    /// on either side.
    pub fn is_banned(&self, address: IpAddr, port: u16) -> bool {
        let banned = self.banned.lock();
        if port == 0 {
            return banned.keys().any(|e| e.address == address);
        }
        banned.contains_key(&BanEntry { address, port })
            || banned.contains_key(&BanEntry { address, port: 0 })
    }

    /// Whether any entry bans `address`, on any port. Inbound accepts are
    /// gated on this, since a dialing peer's source port is ephemeral.
    pub fn is_address_banned(&self, address: IpAddr) -> bool {
        self.banned.lock().keys().any(|e| e.address == address)
    }

    pub fn ban(&self, address: IpAddr, port: u16, id: Option<NodeId>) {
        info!("banning {}:{}", address, port);
        let mut banned = self.banned.lock();
        banned.insert(BanEntry { address, port }, id);
        self.dump_to_file(&banned);
    }

    pub fn unban(&self, address: IpAddr, port: u16) {
        info!("unbanning {}:{}", address, port);
        let mut banned = self.banned.lock();
        banned.remove(&BanEntry { address, port });
        self.dump_to_file(&banned);
    }

    /// Removes every entry recorded under `id`. Returns whether any
    /// matched.
    pub fn unban_id(&self, id: &NodeId) -> bool {
        let mut banned = self.banned.lock();
        let before = banned.len();
        banned.retain(|_, entry_id| entry_id.as_ref() != Some(id));
        let removed = banned.len() != before;
        if removed {
            self.dump_to_file(&banned);
        }
        removed
    }

    pub fn banned(&self) -> Vec<BanEntry> {
        self.banned.lock().keys().copied().collect()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
        let mut banned = self.banned.lock();
        banned.clear();
        self.dump_to_file(&banned);
    }

    /// Parks an id until its contact is resolved.
    pub fn add_waiting(&self, id: NodeId) {
        self.queue.lock().insert(id);
    }

    /// Claims a parked id, if present.
    pub fn take_waiting(&self, id: &NodeId) -> bool {
        self.queue.lock().remove(id)
    }
}

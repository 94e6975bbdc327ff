use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::dht::NodeContact;
use crate::id::NodeId;

/// Default UDP+TCP listen port.
pub const DEFAULT_PORT: u16 = 31392;

/// Host configuration.
///
/// Every timer the overlay runs on is a field here so embedders (and
/// tests) can tighten or relax them; the defaults are the protocol's
/// reference values.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local node id (required).
    pub id: NodeId,

    /// Bind address; defaults to all interfaces.
    pub listen_address: IpAddr,

    /// UDP and TCP bind port.
    pub listen_port: u16,

    /// Accepted for API compatibility; NAT traversal itself is performed
    /// by the embedder. Registration packets still carry the internal
    /// endpoint so NAT'd peers are detected either way.
    pub traverse_nat: bool,

    /// Bootstrap from the built-in node list instead of `custom_boot_nodes`.
    pub use_default_boot_nodes: bool,

    /// Accumulate a global view of known nodes, refreshed every 10 minutes,
    /// instead of reporting only the routing table's contents.
    pub full_net_discovery: bool,

    /// Bootstrap contacts used when `use_default_boot_nodes` is false.
    pub custom_boot_nodes: Vec<NodeContact>,

    /// Opaque value carried in this node's PINGs.
    pub host_data: u64,

    /// Where the ban list is persisted.
    pub ban_file: PathBuf,

    /// Stream connection idle timeout.
    pub idle_timeout: Duration,

    /// Ping interval and per-ping expiry.
    pub ping_interval: Duration,

    /// DHT lookup expiry (node and fragment lookups).
    pub lookup_timeout: Duration,

    /// Random-id discovery interval.
    pub discovery_interval: Duration,

    /// Fragment republication interval.
    pub republication_interval: Duration,

    /// How long a failed dial keeps a peer in the unreachable cache.
    pub unreachable_ttl: Duration,
}

impl Config {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_PORT,
            traverse_nat: true,
            use_default_boot_nodes: true,
            full_net_discovery: false,
            custom_boot_nodes: Vec::new(),
            host_data: 0,
            ban_file: PathBuf::from("banlist.dat"),
            idle_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(8),
            lookup_timeout: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(60),
            republication_interval: Duration::from_secs(60 * 60),
            unreachable_ttl: Duration::from_secs(120),
        }
    }

    /// The bootstrap list this configuration selects.
    pub fn boot_nodes(&self) -> Vec<NodeContact> {
        if self.use_default_boot_nodes {
            default_boot_nodes()
        } else {
            self.custom_boot_nodes.clone()
        }
    }
}

/// Built-in bootstrap contacts for the public overlay.
pub fn default_boot_nodes() -> Vec<NodeContact> {
    // No public deployment yet; embedders supply custom_boot_nodes.
    Vec::new()
}

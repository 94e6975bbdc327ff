//! End-to-end overlay scenarios on localhost with tightened timers.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use kadnet::{Config, Event, Host, MemoryStore, NodeContact, NodeId};

struct Node {
    host: Arc<Host>,
    events: mpsc::UnboundedReceiver<Event>,
    _dir: tempfile::TempDir,
}

impl Node {
    fn contact(&self) -> NodeContact {
        self.host.contact().clone()
    }
}

async fn spawn_node(boot: Vec<NodeContact>) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::new(NodeId::generate());
    config.listen_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.listen_port = 0;
    config.use_default_boot_nodes = false;
    config.custom_boot_nodes = boot;
    config.ban_file = dir.path().join("banlist.dat");
    config.ping_interval = Duration::from_millis(200);
    config.lookup_timeout = Duration::from_millis(800);
    config.discovery_interval = Duration::from_millis(500);
    config.republication_interval = Duration::from_secs(3600);
    config.idle_timeout = Duration::from_secs(10);

    let (host, events) = Host::spawn(config, Arc::new(MemoryStore::new()))
        .await
        .unwrap();
    Node {
        host,
        events,
        _dir: dir,
    }
}

/// Waits until `pred` accepts an event, discarding everything else.
async fn wait_for(node: &mut Node, deadline: Duration, mut pred: impl FnMut(&Event) -> bool) -> Event {
    let end = Instant::now() + deadline;
    loop {
        let remaining = end.saturating_duration_since(Instant::now());
        let event = timeout(remaining, node.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Polls until both hosts track each other.
async fn wait_meshed(nodes: &mut [&mut Node]) {
    let ids: Vec<NodeId> = nodes.iter().map(|n| n.host.local_id()).collect();
    let end = Instant::now() + Duration::from_secs(15);
    loop {
        let mut done = true;
        for node in nodes.iter() {
            let known = node.host.known_nodes();
            let missing = ids
                .iter()
                .filter(|id| **id != node.host.local_id())
                .any(|id| !known.iter().any(|c| c.id == *id));
            if missing {
                done = false;
                break;
            }
        }
        if done {
            return;
        }
        assert!(Instant::now() < end, "overlay did not mesh in time");
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn two_node_bootstrap() {
    let mut a = spawn_node(Vec::new()).await;
    let mut b = spawn_node(vec![a.contact()]).await;

    let a_id = a.host.local_id();
    let b_id = b.host.local_id();

    let found_at_b = wait_for(&mut b, Duration::from_secs(10), |e| {
        matches!(e, Event::NodeDiscovered(c) if c.id == a_id)
    })
    .await;
    let Event::NodeDiscovered(a_seen_by_b) = found_at_b else {
        unreachable!()
    };
    assert_eq!(a_seen_by_b.udp_port, a.contact().udp_port);

    wait_for(&mut a, Duration::from_secs(10), |e| {
        matches!(e, Event::NodeDiscovered(c) if c.id == b_id)
    })
    .await;

    // each side tracks exactly one peer, and exactly one discovery fired
    assert_eq!(a.host.known_nodes().len(), 1);
    assert_eq!(b.host.known_nodes().len(), 1);

    sleep(Duration::from_millis(600)).await;
    while let Ok(event) = a.events.try_recv() {
        assert!(
            !matches!(event, Event::NodeDiscovered(_)),
            "duplicate discovery at a: {:?}",
            event
        );
    }

    a.host.shutdown().await;
    b.host.shutdown().await;
}

#[tokio::test]
async fn broadcast_reaches_every_peer_exactly_once() {
    let mut a = spawn_node(Vec::new()).await;
    let mut b = spawn_node(vec![a.contact()]).await;
    let mut c = spawn_node(vec![a.contact(), b.contact()]).await;

    wait_meshed(&mut [&mut a, &mut b, &mut c]).await;

    let a_id = a.host.local_id();
    let payload = b"flood the overlay".to_vec();
    a.host.send_broadcast(payload.clone());

    for node in [&mut b, &mut c] {
        let event = wait_for(node, Duration::from_secs(10), |e| {
            matches!(e, Event::MessageReceived { .. })
        })
        .await;
        let Event::MessageReceived { from, payload: got } = event else {
            unreachable!()
        };
        assert_eq!(from, a_id);
        assert_eq!(got, payload);
    }

    // no duplicate deliveries, and the sender never hears its own broadcast
    sleep(Duration::from_millis(800)).await;
    for node in [&mut a, &mut b, &mut c] {
        while let Ok(event) = node.events.try_recv() {
            assert!(
                !matches!(event, Event::MessageReceived { .. }),
                "unexpected delivery: {:?}",
                event
            );
        }
    }

    a.host.shutdown().await;
    b.host.shutdown().await;
    c.host.shutdown().await;
}

#[tokio::test]
async fn direct_message_is_delivered_over_a_fresh_dial() {
    let mut a = spawn_node(Vec::new()).await;
    let mut b = spawn_node(vec![a.contact()]).await;

    wait_meshed(&mut [&mut a, &mut b]).await;

    let payload = b"hello directly".to_vec();
    a.host.send_direct(b.host.local_id(), payload.clone());

    let event = wait_for(&mut b, Duration::from_secs(10), |e| {
        matches!(e, Event::MessageReceived { .. })
    })
    .await;
    let Event::MessageReceived { from, payload: got } = event else {
        unreachable!()
    };
    assert_eq!(from, a.host.local_id());
    assert_eq!(got, payload);

    a.host.shutdown().await;
    b.host.shutdown().await;
}

#[tokio::test]
async fn broadcast_fallback_reaches_an_unconnected_peer() {
    let mut a = spawn_node(Vec::new()).await;
    let mut b = spawn_node(vec![a.contact()]).await;

    wait_meshed(&mut [&mut a, &mut b]).await;

    // no stream connection exists yet, so this goes out as a broadcast
    let payload = b"catch me either way".to_vec();
    a.host
        .send_broadcast_if_no_connection(b.host.local_id(), payload.clone());

    let event = wait_for(&mut b, Duration::from_secs(10), |e| {
        matches!(e, Event::MessageReceived { .. })
    })
    .await;
    let Event::MessageReceived { from, payload: got } = event else {
        unreachable!()
    };
    assert_eq!(from, a.host.local_id());
    assert_eq!(got, payload);

    // the broadcast's delivery rode the stream connection it opened, so
    // the same call now takes the direct path
    let direct = b"now directly".to_vec();
    a.host
        .send_broadcast_if_no_connection(b.host.local_id(), direct.clone());
    let event = wait_for(&mut b, Duration::from_secs(10), |e| {
        matches!(e, Event::MessageReceived { .. })
    })
    .await;
    let Event::MessageReceived { payload: got, .. } = event else {
        unreachable!()
    };
    assert_eq!(got, direct);

    a.host.shutdown().await;
    b.host.shutdown().await;
}

#[tokio::test]
async fn fragment_stored_on_one_node_is_found_by_another() {
    let mut a = spawn_node(Vec::new()).await;
    let mut b = spawn_node(vec![a.contact()]).await;
    let mut c = spawn_node(vec![a.contact(), b.contact()]).await;
    let mut d = spawn_node(vec![a.contact(), b.contact()]).await;
    let mut e = spawn_node(vec![a.contact(), c.contact()]).await;

    wait_meshed(&mut [&mut a, &mut b, &mut c, &mut d, &mut e]).await;

    let id = NodeId::generate();
    let value = vec![0xde, 0xad];
    a.host.store_fragment(id, value.clone()).unwrap();

    // give the STORE datagrams a moment to land
    sleep(Duration::from_millis(300)).await;

    e.host.find_fragment(id);
    let event = wait_for(&mut e, Duration::from_secs(10), |ev| {
        matches!(ev, Event::FragmentFound { id: got, .. } if *got == id)
    })
    .await;
    let Event::FragmentFound { data, .. } = event else {
        unreachable!()
    };
    assert_eq!(data, value);

    for node in [a, b, c, d, e] {
        node.host.shutdown().await;
    }
}

#[tokio::test]
async fn fragment_lookup_on_missing_id_times_out_once() {
    let mut a = spawn_node(Vec::new()).await;
    let mut b = spawn_node(vec![a.contact()]).await;

    wait_meshed(&mut [&mut a, &mut b]).await;

    let id = NodeId::generate();
    b.host.find_fragment(id);

    let event = wait_for(&mut b, Duration::from_secs(10), |ev| {
        matches!(ev, Event::FragmentNotFound(got) if *got == id)
    })
    .await;
    assert_eq!(event, Event::FragmentNotFound(id));

    sleep(Duration::from_millis(1200)).await;
    while let Ok(event) = b.events.try_recv() {
        assert!(
            !matches!(event, Event::FragmentNotFound(got) if got == id),
            "lookup resolved twice"
        );
    }

    a.host.shutdown().await;
    b.host.shutdown().await;
}

#[tokio::test]
async fn banned_peer_is_cut_off() {
    let mut a = spawn_node(Vec::new()).await;
    let mut b = spawn_node(vec![a.contact()]).await;

    wait_meshed(&mut [&mut a, &mut b]).await;

    let b_contact = b.contact();
    a.host.ban(b.host.local_id());

    let banned = a.host.ban_list();
    assert!(banned
        .iter()
        .any(|entry| entry.address == b_contact.address && entry.port == b_contact.tcp_port));

    // outbound sends to the banned peer are suppressed
    a.host.send_direct(b.host.local_id(), b"should not arrive".to_vec());
    // inbound dials from the banned address are rejected before handshake
    b.host.send_direct(a.host.local_id(), b"also blocked".to_vec());

    sleep(Duration::from_millis(800)).await;
    while let Ok(event) = a.events.try_recv() {
        assert!(
            !matches!(event, Event::MessageReceived { .. }),
            "banned peer delivered a message"
        );
    }
    while let Ok(event) = b.events.try_recv() {
        assert!(
            !matches!(event, Event::MessageReceived { .. }),
            "message reached the banned peer"
        );
    }

    // unban restores the endpoint
    a.host.unban(b.host.local_id());
    assert!(a.host.ban_list().is_empty());

    a.host.shutdown().await;
    b.host.shutdown().await;
}

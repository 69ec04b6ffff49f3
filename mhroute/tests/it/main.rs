use std::sync::Arc;

use mhroute::{AddressScheme, Link, Network, Node, Topology};
use mhroute_netns::fake::FakeNetwork;

mod descriptor;
mod failures;
mod idempotence;
mod scenario;

pub const DESCRIPTOR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/it/three_path.json");

/// A router bridging a single-homed server and a client with three paths to it.
pub fn three_path() -> Topology {
    Topology::new()
        .node(Node::router("router", 4))
        .node(Node::host("server", 1, AddressScheme::new(10, 24)))
        .node(Node::host("client", 3, AddressScheme::new(11, 24)))
        .link(Link::new(("router", "router-eth0"), ("server", "server-eth0")).bandwidth_kbit(5000))
        .link(Link::new(("router", "router-eth1"), ("client", "client-eth0")).bandwidth_kbit(1000))
        .link(Link::new(("router", "router-eth2"), ("client", "client-eth1")).bandwidth_kbit(750))
        .link(Link::new(("router", "router-eth3"), ("client", "client-eth2")).bandwidth_kbit(500))
}

/// Fake namespaces matching every node of `topology`.
pub fn fake_for(topology: &Topology) -> Arc<FakeNetwork> {
    let fake = topology.nodes.iter().fold(FakeNetwork::new(), |fake, node| {
        fake.with_node(&node.name, node.interfaces.iter().map(|i| i.name.clone()))
    });
    Arc::new(fake)
}

pub async fn set_up(topology: Topology) -> (Network, Arc<FakeNetwork>) {
    let _ = tracing_subscriber::fmt::try_init();

    let fake = fake_for(&topology);
    let mut network = Network::new(topology, fake.clone()).unwrap();
    let report = network.setup().await;
    assert!(report.is_success(), "setup failed: {report:?}");

    (network, fake)
}

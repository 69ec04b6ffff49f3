use mhroute::{
    network::Error,
    plan::PlanError,
    routing::{ApplyFailure, Step},
    AddressScheme, Link, Network, Node, TableId, Topology,
};
use mhroute_netns::command;

use crate::{fake_for, three_path};

#[tokio::test]
async fn failing_node_does_not_abort_siblings() {
    let topology = three_path();
    let fake = fake_for(&topology);
    fake.fail_matching("client", "table 101");

    let mut network = Network::new(topology, fake.clone()).unwrap();
    let report = network.setup().await;

    assert_eq!(report.failures.len(), 1);
    let Some(Error::Routing(err)) = report.failure("client") else {
        panic!("unexpected report: {report:?}");
    };
    assert_eq!(err.node, "client");
    assert_eq!(
        err.step,
        Step::SubnetRoute { interface: "client-eth1".into(), table: TableId::new("rt_client_eth1") }
    );
    assert!(matches!(&err.source, ApplyFailure::Command(command::Error::NonZero { output, .. }) if output.status == 2));

    // The first table stayed in place, nothing after the failure ran.
    assert_eq!(fake.routes("client", 100).len(), 2);
    assert!(fake.routes("client", 102).is_empty());
    assert_eq!(fake.rules("client").len(), 3 + 2);

    // Siblings were configured regardless.
    assert_eq!(fake.sysctl("router", "net.ipv4.ip_forward").as_deref(), Some("1"));
    assert_eq!(fake.addresses("server", "server-eth0").len(), 1);
    assert_eq!(fake.qdiscs("client", "client-eth2"), ["netem rate 500kbit"]);

    // Re-applying after the cause is gone completes the node.
    fake.clear_failures("client");
    assert!(network.setup().await.is_success());
    assert_eq!(fake.routes("client", 102).len(), 2);
    assert_eq!(fake.rules("client").len(), 3 + 6);
}

#[tokio::test]
async fn failed_forwarding_leaves_router_unconfigured() {
    let topology = three_path();
    let fake = fake_for(&topology);
    fake.fail_matching("router", "ip_forward");

    let mut network = Network::new(topology, fake.clone()).unwrap();
    let report = network.setup().await;

    assert!(matches!(report.failure("router"), Some(Error::Forwarding(_))));
    assert!(fake.addresses("router", "router-eth0").is_empty());
    assert_eq!(network.forwarding_state("router"), Some(mhroute::forwarding::ForwardingState::Disabled));
    assert!(report.into_result().is_err());
}

#[tokio::test]
async fn shaping_failure_is_scoped_to_the_link() {
    let topology = three_path();
    let fake = fake_for(&topology);
    fake.fail_matching("client", "dev client-eth2 root");

    let mut network = Network::new(topology, fake.clone()).unwrap();
    let report = network.setup().await;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].scope, "router:router-eth3 <-> client:client-eth2");
    assert!(matches!(report.failure("router:router-eth3 <-> client:client-eth2"), Some(Error::Shaping(_))));
    assert_eq!(fake.qdiscs("client", "client-eth1"), ["netem rate 750kbit"]);
}

#[tokio::test]
async fn invalid_scheme_fails_planning_for_the_node_and_its_router() {
    let mut topology = three_path();
    topology.nodes[2].scheme = Some(mhroute::AddressScheme::new(11, 31));
    let fake = fake_for(&topology);

    let mut network = Network::new(topology, fake.clone()).unwrap();
    let report = network.setup().await;

    assert!(matches!(report.failure("client"), Some(Error::Plan(_))));
    assert!(matches!(report.failure("router"), Some(Error::Plan(_))));
    // Only shaping reached the client.
    assert!(fake.history("client").iter().all(|c| c.starts_with("tc qdisc replace")));
    assert!(fake.history("router").is_empty());
    assert_eq!(fake.addresses("server", "server-eth0").len(), 1);
}

#[tokio::test]
async fn router_refuses_hosts_sharing_a_subnet() {
    let topology = Topology::new()
        .node(Node::router("router", 2))
        .node(Node::host("a", 1, AddressScheme::new(11, 24)))
        .node(Node::host("b", 1, AddressScheme::new(11, 24)))
        .link(Link::new(("router", "router-eth0"), ("a", "a-eth0")))
        .link(Link::new(("router", "router-eth1"), ("b", "b-eth0")));
    let fake = fake_for(&topology);

    let mut network = Network::new(topology, fake.clone()).unwrap();
    let report = network.setup().await;

    assert_eq!(report.failures.len(), 1);
    assert!(matches!(
        report.failure("router"),
        Some(Error::Plan(PlanError::OverlappingSubnets { node, .. })) if node == "router"
    ));
    assert!(network.plan("router").is_none());
    assert!(fake.addresses("router", "router-eth0").is_empty());
    assert!(fake.addresses("router", "router-eth1").is_empty());

    // The hosts live in separate namespaces and are configured regardless.
    assert_eq!(fake.addresses("a", "a-eth0")[0].to_string(), "11.0.0.2/24");
    assert_eq!(fake.addresses("b", "b-eth0")[0].to_string(), "11.0.0.2/24");
}

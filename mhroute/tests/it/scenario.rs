use std::net::Ipv4Addr;

use mhroute::{
    forwarding::ForwardingState,
    network::NodePlan,
    plan,
    shaping::{Shaper, ShapingPolicy},
    topology::Endpoint,
};
use mhroute_netns::fake::{RouteDecision, TABLE_MAIN};

use crate::{set_up, three_path};

const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

fn via(table: u32, dev: &str, gateway: Ipv4Addr) -> Option<RouteDecision> {
    Some(RouteDecision { table, dev: dev.to_owned(), via: Some(gateway) })
}

#[tokio::test]
async fn replies_leave_through_the_interface_they_belong_to() {
    let (network, fake) = set_up(three_path()).await;

    for i in 0..3u8 {
        let local = Ipv4Addr::new(11, 0, i, 2);
        let table = network.tables().number(&mhroute::TableId::new(format!("rt_client_eth{i}"))).unwrap();
        assert_eq!(table, 100 + u32::from(i));

        assert_eq!(
            fake.route_lookup("client", Some(local), SERVER),
            via(table, &format!("client-eth{i}"), Ipv4Addr::new(11, 0, i, 1)),
            "reply from {local}"
        );
    }

    // Unbound traffic takes the main default through the first interface.
    assert_eq!(
        fake.route_lookup("client", None, SERVER),
        via(TABLE_MAIN, "client-eth0", Ipv4Addr::new(11, 0, 0, 1))
    );

    // Traffic to a secondary address is resolved through that address's table.
    let to_secondary = fake.route_lookup("client", None, Ipv4Addr::new(11, 0, 1, 2)).unwrap();
    assert_eq!((to_secondary.table, to_secondary.dev.as_str()), (101, "client-eth1"));
}

#[tokio::test]
async fn multi_homed_client_gets_one_table_per_interface() {
    let (network, fake) = set_up(three_path()).await;

    assert_eq!(network.tables().len(), 3);
    assert_eq!(network.tables().rt_tables(), "100\trt_client_eth0\n101\trt_client_eth1\n102\trt_client_eth2\n");

    // Three default rules plus a source and a destination rule per interface.
    let rules = fake.rules("client");
    assert_eq!(rules.len(), 3 + 6);
    for table in 100..103 {
        assert_eq!(rules.iter().filter(|r| r.table == table).count(), 2);
        let routes = fake.routes("client", table);
        assert_eq!(routes.len(), 2);
        assert!(routes.iter().all(|r| r.dev == format!("client-eth{}", table - 100)));
    }
}

#[tokio::test]
async fn single_homed_server_uses_main_table() {
    let (network, fake) = set_up(three_path()).await;

    let server = network.topology().get("server").unwrap();
    assert!(plan::plan(server).unwrap().is_empty());
    assert!(matches!(network.plan("server"), Some(NodePlan::SingleHomed(_))));

    assert_eq!(fake.rules("server").len(), 3);
    assert_eq!(fake.addresses("server", "server-eth0")[0].to_string(), "10.0.0.2/24");
    assert_eq!(
        fake.route_lookup("server", None, Ipv4Addr::new(11, 0, 2, 2)),
        via(TABLE_MAIN, "server-eth0", Ipv4Addr::new(10, 0, 0, 1))
    );
}

#[tokio::test]
async fn router_bridges_every_subnet() {
    let (network, fake) = set_up(three_path()).await;

    assert_eq!(network.forwarding_state("router"), Some(ForwardingState::Enabled));
    assert_eq!(fake.sysctl("router", "net.ipv4.ip_forward").as_deref(), Some("1"));

    let expected = ["10.0.0.1/24", "11.0.0.1/24", "11.0.1.1/24", "11.0.2.1/24"];
    for (i, address) in expected.iter().enumerate() {
        let dev = format!("router-eth{i}");
        assert_eq!(fake.addresses("router", &dev)[0].to_string(), *address);
    }

    let to_client = fake.route_lookup("router", None, Ipv4Addr::new(11, 0, 1, 2)).unwrap();
    assert_eq!((to_client.dev.as_str(), to_client.via), ("router-eth2", None));

    // Router interfaces are not shaped unless a link asks for it.
    assert!(fake.qdiscs("router", "router-eth2").is_empty());
    assert_eq!(fake.qdiscs("client", "client-eth1"), ["netem rate 750kbit"]);
}

#[tokio::test]
async fn reshaping_leaves_a_single_policy() {
    let (network, fake) = set_up(three_path()).await;
    let shaper = Shaper::new(&*fake, network.topology());
    let end = Endpoint::new("client", "client-eth1");

    shaper.shape(&end, ShapingPolicy::new(750)).await.unwrap();
    shaper.shape(&end, ShapingPolicy::new(500)).await.unwrap();

    assert_eq!(fake.qdiscs("client", "client-eth1"), ["netem rate 500kbit"]);
}

#[tokio::test]
async fn teardown_disables_forwarding() {
    let (mut network, fake) = set_up(three_path()).await;

    assert!(network.teardown().await.is_success());
    assert!(network.teardown().await.is_success());

    assert_eq!(network.forwarding_state("router"), Some(ForwardingState::Disabled));
    assert_eq!(fake.sysctl("router", "net.ipv4.ip_forward").as_deref(), Some("0"));
    let toggles = fake.history("router").iter().filter(|c| c.starts_with("sysctl -w")).count();
    assert_eq!(toggles, 2);
}

#[tokio::test]
async fn dump_shows_rules_and_tables() {
    let (network, _fake) = set_up(three_path()).await;

    let dump = network.dump("client").await.unwrap();
    assert!(dump.rules.contains("1101:\tfrom 11.0.1.2 lookup 101"));
    assert!(dump.rules.contains("1101:\tfrom all to 11.0.1.2 lookup 101"));
    assert!(dump.routes.contains("11.0.1.0/24 dev client-eth1 src 11.0.1.2 table 101"));
}

use mhroute::Network;
use mhroute_netns::{Argv, NamespaceExec};

use crate::{fake_for, set_up, three_path};

#[tokio::test]
async fn second_setup_changes_nothing() {
    let (mut network, fake) = set_up(three_path()).await;

    let rules = fake.rules("client");
    let tables: Vec<_> = (100..103).map(|t| fake.routes("client", t)).collect();
    let main = fake.routes("client", mhroute_netns::fake::TABLE_MAIN);
    let commands = fake.history("client").len();

    let report = network.setup().await;
    assert!(report.is_success(), "{report:?}");

    assert_eq!(fake.rules("client"), rules);
    assert_eq!((100..103).map(|t| fake.routes("client", t)).collect::<Vec<_>>(), tables);
    assert_eq!(fake.routes("client", mhroute_netns::fake::TABLE_MAIN), main);
    assert_eq!(network.tables().len(), 3);

    // The second pass only lists rules, it never adds any.
    let second_pass = &fake.history("client")[commands..];
    assert!(!second_pass.is_empty());
    assert!(second_pass.iter().all(|c| !c.starts_with("ip rule add")));
}

#[tokio::test]
async fn setup_adopts_rules_added_by_hand() {
    let topology = three_path();
    let fake = fake_for(&topology);

    // A previous run installed the first table's rules, with another priority.
    let exec: &dyn NamespaceExec = &*fake;
    for argv in [
        "ip rule add pref 500 from 11.0.0.2 table 100",
        "ip rule add pref 500 to 11.0.0.2/32 table 100",
    ] {
        exec.exec_checked("client", &Argv::from_str_ws(argv)).await.unwrap();
    }

    let mut network = Network::new(topology, fake.clone()).unwrap();
    assert!(network.setup().await.is_success());

    assert_eq!(fake.rules("client").iter().filter(|r| r.table == 100).count(), 2);
    assert_eq!(fake.rules("client").len(), 3 + 6);
}

#[tokio::test]
async fn addresses_precede_routes_and_routes_precede_rules() {
    let (_network, fake) = set_up(three_path()).await;
    let history = fake.history("client");
    let position = |pred: &dyn Fn(&String) -> bool| history.iter().position(pred).unwrap();

    for i in 0..3 {
        let address = position(&|c| c == &format!("ip addr replace 11.0.{i}.2/24 dev client-eth{i}"));
        let link_up = position(&|c| c == &format!("ip link set dev client-eth{i} up"));
        let table = 100 + i;
        let first_route = position(&|c| c.starts_with("ip route") && c.ends_with(&format!("table {table}")));
        let first_rule = position(&|c| c.starts_with("ip rule add") && c.ends_with(&format!("table {table}")));

        assert!(address < link_up);
        assert!(link_up < first_route);
        assert!(first_route < first_rule);
    }

    // Shaping runs once routing is done.
    let last_routing = history.iter().rev().find(|c| !c.starts_with("tc ")).unwrap();
    assert_eq!(last_routing, "ip route replace default via 11.0.0.1 dev client-eth0");
}

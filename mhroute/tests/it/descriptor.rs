use mhroute::{Network, Topology};

use crate::{fake_for, three_path, DESCRIPTOR};

#[tokio::test]
async fn descriptor_file_describes_the_three_path_topology() {
    let topology = Topology::from_path(DESCRIPTOR).unwrap();
    assert_eq!(topology, three_path());

    let fake = fake_for(&topology);
    let mut network = Network::new(topology, fake.clone()).unwrap();
    assert!(network.setup().await.is_success());
    assert_eq!(fake.qdiscs("server", "server-eth0"), ["netem rate 5000kbit"]);
}
